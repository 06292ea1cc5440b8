// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    os::fd::RawFd,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::Bus,
    codec::framing::Frame,
    error::{BusError, CompletionStatus},
    models::ops::{Builder, OpCode, OpRequest, OpResponse},
};

/// The high-level request/response surface over a session —
/// `Put`/`Get`/`GetNext`/`GetPrevious`/`Delete`/`GetKeyRange`/`GetLog`/
/// `Flush`/`NoOp`/`P2P` plus batch, one method per operation, all
/// funneling through [`send`].
pub trait Session {
    async fn send(&self, req: OpRequest) -> Result<OpResponse, BusError>;

    async fn put(&self, key: bytes::Bytes, value: bytes::Bytes) -> Result<OpResponse, BusError> {
        self.send(OpRequest::put(key, value)).await
    }

    async fn get(&self, key: bytes::Bytes) -> Result<OpResponse, BusError> {
        self.send(OpRequest::get(key)).await
    }

    async fn get_next(&self, key: bytes::Bytes) -> Result<OpResponse, BusError> {
        self.send(OpRequest::new(OpCode::GetNext, key, bytes::Bytes::new()))
            .await
    }

    async fn get_previous(&self, key: bytes::Bytes) -> Result<OpResponse, BusError> {
        self.send(OpRequest::new(
            OpCode::GetPrevious,
            key,
            bytes::Bytes::new(),
        ))
        .await
    }

    async fn delete(&self, key: bytes::Bytes) -> Result<OpResponse, BusError> {
        self.send(OpRequest::delete(key)).await
    }

    async fn get_key_range(
        &self,
        start_key: bytes::Bytes,
        end_key: bytes::Bytes,
    ) -> Result<OpResponse, BusError> {
        self.send(OpRequest::new(OpCode::GetKeyRange, start_key, end_key))
            .await
    }

    async fn get_log(&self) -> Result<OpResponse, BusError> {
        self.send(OpRequest::new(
            OpCode::GetLog,
            bytes::Bytes::new(),
            bytes::Bytes::new(),
        ))
        .await
    }

    async fn flush(&self) -> Result<OpResponse, BusError> {
        self.send(OpRequest::new(
            OpCode::Flush,
            bytes::Bytes::new(),
            bytes::Bytes::new(),
        ))
        .await
    }

    async fn no_op(&self) -> Result<OpResponse, BusError> {
        self.send(OpRequest::nop()).await
    }

    async fn p2p(&self, key: bytes::Bytes, value: bytes::Bytes) -> Result<OpResponse, BusError> {
        self.send(OpRequest::new(OpCode::P2P, key, value)).await
    }

    /// Submits `ops` as a single wire message. The default implementation
    /// packs every sub-operation's key into `value` separated by a length
    /// prefix so a `Builder` can split it back apart; callers with a real
    /// device protocol typically override this with their protobuf-native
    /// batch encoding.
    async fn batch(&self, ops: Vec<OpRequest>) -> Result<OpResponse, BusError> {
        let mut packed = bytes::BytesMut::new();
        for op in &ops {
            packed.extend_from_slice(&(op.key.len() as u32).to_be_bytes());
            packed.extend_from_slice(&op.key);
            packed.extend_from_slice(&(op.value.len() as u32).to_be_bytes());
            packed.extend_from_slice(&op.value);
        }
        self.send(OpRequest::new(OpCode::Batch, bytes::Bytes::new(), packed.freeze()))
            .await
    }
}

/// A weak self-reference, attached after construction so background work
/// spawned by the pool can upgrade back to a live `Arc<SessionPool>`
/// without holding a strong cycle.
type SelfRef = OnceCell<Weak<SessionPool>>;

/// Reconstructs an [`OpResponse`] from the [`Frame`] the default wire
/// codec decodes every response into. Paired with a [`Builder`]: the
/// `Builder` turns an `OpRequest` into outbound bytes and picks the
/// `seq_id`, and the matching `ResponseDecoder` turns the `Frame` that
/// comes back into the `OpResponse` `Session::send` returns. A real
/// device protocol typically decodes `frame.proto` as a protobuf message
/// and folds its fields together with `frame.value` into `OpResponse`.
pub trait ResponseDecoder: Send + Sync {
    fn decode(&self, frame: &Frame) -> Result<OpResponse, BusError>;
}

/// Minimal default [`Session`] implementation: round-robins requests
/// across a fixed set of fds already registered with the bus, generating
/// a strictly-increasing `seq_id` per fd via the supplied [`Builder`] and
/// decoding responses via the supplied [`ResponseDecoder`].
///
/// Not a full connection manager — no reconnect, no login handshake, no
/// multi-session fan-out. Callers with those needs are expected to supply
/// their own `Session`; this exists so the crate's own tests and examples
/// have something to drive [`crate::bus::Bus::send_request`] through
/// without hand-rolling the round-robin and seq_id bookkeeping every
/// time.
pub struct SessionPool {
    bus: Arc<Bus>,
    builder: Arc<dyn Builder>,
    decoder: Arc<dyn ResponseDecoder>,
    conns: DashMap<RawFd, ()>,
    order: std::sync::Mutex<Vec<RawFd>>,
    next: AtomicUsize,
    sender_timeout: Duration,
    shutdown: CancellationToken,
    self_ref: SelfRef,
}

impl SessionPool {
    pub fn new(
        bus: Arc<Bus>,
        builder: Arc<dyn Builder>,
        decoder: Arc<dyn ResponseDecoder>,
        sender_timeout: Duration,
    ) -> Arc<Self> {
        let pool = Arc::new(SessionPool {
            bus,
            builder,
            decoder,
            conns: DashMap::new(),
            order: std::sync::Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            sender_timeout,
            shutdown: CancellationToken::new(),
            self_ref: OnceCell::new(),
        });
        pool.attach_self();
        pool
    }

    fn attach_self(self: &Arc<Self>) {
        let _ = self.self_ref.set(Arc::downgrade(self));
    }

    /// Returns a strong handle to this pool from code that only holds a
    /// weak reference (e.g. a callback registered with the bus).
    pub fn upgrade_self(&self) -> Option<Arc<Self>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    /// Adds `fd` (already registered with the underlying bus) to the
    /// round-robin set this pool dispatches requests across.
    pub fn add_connection(&self, fd: RawFd) {
        if self.conns.insert(fd, ()).is_none()
            && let Ok(mut order) = self.order.lock()
        {
            order.push(fd);
        }
    }

    pub fn remove_connection(&self, fd: RawFd) {
        self.conns.remove(&fd);
        if let Ok(mut order) = self.order.lock() {
            order.retain(|f| *f != fd);
        }
    }

    /// Cancels cooperative shutdown: any in-flight [`Session::send`] call
    /// racing against this token returns `Err(BusError::Shutdown)`
    /// immediately instead of waiting out the full `sender_timeout`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn pick_connection(&self) -> Result<RawFd, BusError> {
        let order = self
            .order
            .lock()
            .map_err(|_| BusError::Fatal("session pool connection order lock poisoned".into()))?;
        if order.is_empty() {
            return Err(BusError::UnregisteredSocket(-1));
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % order.len();
        Ok(order[idx])
    }
}

impl Session for SessionPool {
    async fn send(&self, req: OpRequest) -> Result<OpResponse, BusError> {
        let fd = self.pick_connection()?;
        let seq_id = self.builder.next_seq_id(fd);
        let bytes = self.builder.encode(seq_id, &req);
        let deadline = tokio::time::Instant::now() + self.sender_timeout;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let callback = Box::new(move |result: crate::bus::boxed_message::CompletionResult| {
            let _ = tx.send(result);
        });

        self.bus
            .send_request(fd, seq_id, bytes, deadline, callback, None)
            .await?;

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(BusError::Shutdown),
            result = rx => {
                let result = result.map_err(|_| {
                    BusError::Fatal("completion channel dropped without firing".into())
                })?;
                match result.status {
                    CompletionStatus::Ok => {
                        let msg = result
                            .message
                            .ok_or_else(|| BusError::Memory("Ok completion with no message".into()))?;
                        let frame = msg
                            .message
                            .downcast::<Frame>()
                            .map_err(|_| BusError::Fatal("decoded message is not a Frame".into()))?;
                        self.decoder.decode(&frame)
                    },
                    CompletionStatus::Timeout => Err(BusError::SendTimeout(format!(
                        "fd {fd} seq_id {seq_id} timed out awaiting response"
                    ))),
                    other => Err(BusError::Fatal(format!("request completed with {other:?}"))),
                }
            }
        }
    }
}
