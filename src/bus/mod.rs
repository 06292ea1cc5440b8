// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The public coordinator: registration/release of sockets, request
//! submission, and shutdown. Owns the listeners, the socket registry,
//! and the thread-pool, and is the single entry point callers drive.

pub mod boxed_message;

use std::{
    os::fd::{AsRawFd, RawFd},
    sync::{
        Arc, Mutex as StdMutex,
        atomic::Ordering,
    },
    time::Duration,
};

use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

pub use boxed_message::{CompletionResult, UserData};

use crate::{
    cfg::{config::BusConfig, enums::{ShutdownState, SocketKind}},
    codec::{Sink, Unpack},
    error::{BusError, CompletionStatus},
    listener::{Listener, ListenerCommand},
    registry::{ConnectionInfo, FdTable},
    sender,
    threadpool::{ThreadPool, ThreadPoolConfig},
    tls::TlsAdapter,
};

/// `opaque_error_id` passed to the unexpected-message hook when it is
/// invoked because a socket died rather than because of a decode failure.
pub const SOCKET_DIED_SENTINEL: i64 = i64::MIN;

type UnexpectedMsgCb = Arc<dyn Fn(RawFd, i64) + Send + Sync>;
type ErrorCb = Arc<dyn Fn(&BusError) + Send + Sync>;

/// Everything [`Bus::init`] needs that cannot round-trip through YAML:
/// the codec contract and the optional hooks. Paired with [`BusConfig`]
/// for the numeric knobs.
pub struct BusInit {
    pub config: BusConfig,
    pub sink: Arc<dyn Sink>,
    pub unpack: Arc<dyn Unpack>,
    pub tls: Option<Arc<TlsAdapter>>,
    pub unexpected_msg_cb: Option<UnexpectedMsgCb>,
    pub error_cb: Option<ErrorCb>,
}

struct ListenerHandle {
    cmd_tx: mpsc::Sender<ListenerCommand>,
    join: StdMutex<Option<JoinHandle<()>>>,
}

/// The asynchronous message bus.
pub struct Bus {
    listeners: Vec<ListenerHandle>,
    registry: StdMutex<FdTable<Arc<ConnectionInfo>>>,
    threadpool: Arc<ThreadPool>,
    tls: Option<Arc<TlsAdapter>>,
    shutdown_state: StdMutex<ShutdownState>,
    config: BusConfig,
    error_cb: Option<ErrorCb>,
    died_reaper: StdMutex<Option<JoinHandle<()>>>,
}

impl Bus {
    /// Allocates listeners, the socket registry, the thread-pool, and
    /// starts every listener task. Configuration is validated up front so
    /// a bad `listener_count`/`threadpool_max_threads` surfaces as
    /// `BusError::Config` rather than a panic deep inside a spawned task.
    pub fn init(mut init: BusInit) -> Result<Arc<Bus>, BusError> {
        init.config
            .validate_and_normalize()
            .map_err(|e| BusError::Config(e.to_string()))?;

        let threadpool = Arc::new(ThreadPool::new(ThreadPoolConfig {
            max_threads: init.config.threadpool_max_threads,
            max_delay_ms: init.config.threadpool_max_delay_ms,
        }));

        let (died_tx, mut died_rx) = mpsc::unbounded_channel::<RawFd>();

        let registry = StdMutex::new(FdTable::new());

        let mut listeners = Vec::with_capacity(init.config.listener_count);
        for index in 0..init.config.listener_count {
            let (cmd_tx, cmd_rx) = mpsc::channel(256);
            let listener = Listener::new(
                index,
                cmd_rx,
                Arc::clone(&init.sink),
                Arc::clone(&init.unpack),
                Arc::clone(&threadpool),
                init.unexpected_msg_cb.clone(),
                died_tx.clone(),
                init.config.backpressure_shift,
            );
            let join = tokio::spawn(listener.run());
            listeners.push(ListenerHandle {
                cmd_tx,
                join: StdMutex::new(Some(join)),
            });
        }

        let bus = Arc::new(Bus {
            listeners,
            registry,
            threadpool,
            tls: init.tls,
            shutdown_state: StdMutex::new(ShutdownState::Running),
            config: init.config,
            error_cb: init.error_cb,
            died_reaper: StdMutex::new(None),
        });

        let reaper_cb = init.unexpected_msg_cb.clone();
        let reaper_bus = Arc::clone(&bus);
        let reaper = tokio::spawn(async move {
            while let Some(fd) = died_rx.recv().await {
                reaper_bus.registry.lock_or_panic().remove(fd);
                if let Some(cb) = &reaper_cb {
                    cb(fd, SOCKET_DIED_SENTINEL);
                }
            }
        });
        *bus.died_reaper.lock_or_panic() = Some(reaper);

        info!(listener_count = bus.config.listener_count, "bus initialized");
        Ok(bus)
    }

    fn listener_for(&self, fd: RawFd) -> &ListenerHandle {
        let idx = (fd as usize) % self.listeners.len();
        &self.listeners[idx]
    }

    /// Connects `tcp` (optionally behind TLS), inserts it into the
    /// registry, and hands it to its owning listener. Returns the fd used
    /// as the registry key.
    pub async fn register_socket(
        self: &Arc<Self>,
        kind: SocketKind,
        tcp: TcpStream,
        server_name: Option<&str>,
        udata: Option<UserData>,
    ) -> Result<RawFd, BusError> {
        if *self.shutdown_state.lock_or_panic() != ShutdownState::Running {
            return Err(BusError::Shutdown);
        }

        let fd = tcp.as_raw_fd();
        let transport = match kind {
            SocketKind::Plain => crate::tls::Transport::plain(tcp),
            SocketKind::Ssl => {
                let adapter = self
                    .tls
                    .as_ref()
                    .ok_or_else(|| BusError::Config("SSL requested but no TLS adapter configured".into()))?;
                let name = server_name.ok_or_else(|| {
                    BusError::Config("SSL requested but no server_name given".into())
                })?;
                adapter.connect(name, tcp).await?
            },
        };

        let (reader, writer) = tokio::io::split(transport);
        let listener_index = (fd as usize) % self.listeners.len();
        let conn = Arc::new(ConnectionInfo::new(fd, writer, udata, listener_index));

        {
            let mut registry = self.registry.lock_or_panic();
            if registry.get(fd).0 {
                return Err(BusError::Config(format!("fd {fd} already registered")));
            }
            registry.set(fd, Arc::clone(&conn));
        }

        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        let cmd = ListenerCommand::AddSocket {
            conn: Arc::clone(&conn),
            reader,
            ack: ack_tx,
        };
        if self.listeners[listener_index].cmd_tx.send(cmd).await.is_err() {
            self.registry.lock_or_panic().remove(fd);
            return Err(BusError::Fatal("listener command channel closed".into()));
        }

        match ack_rx.await {
            Ok(true) => Ok(fd),
            _ => {
                self.registry.lock_or_panic().remove(fd);
                Err(BusError::Fatal("listener rejected socket registration".into()))
            },
        }
    }

    /// Releases a previously registered socket, returning its opaque user
    /// data.
    pub async fn release_socket(&self, fd: RawFd) -> Result<Option<UserData>, BusError> {
        let conn = {
            let registry = self.registry.lock_or_panic();
            let (ok, v) = registry.get(fd);
            if !ok {
                return Err(BusError::UnregisteredSocket(fd));
            }
            Arc::clone(v.expect("checked ok above"))
        };

        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        let cmd = ListenerCommand::RemoveSocket { fd, ack: ack_tx };
        let _ = self.listener_for(fd).cmd_tx.send(cmd).await;
        let _ = ack_rx.await;

        self.registry.lock_or_panic().remove(fd);

        let mut writer = conn.writer.lock().await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await;
        drop(writer);

        Ok(conn.udata.lock_or_panic().take())
    }

    /// Validates and submits a request. `seq_id` must be strictly greater
    /// than the largest previously accepted for `fd`.
    pub async fn send_request(
        &self,
        fd: RawFd,
        seq_id: u64,
        bytes: bytes::Bytes,
        deadline: tokio::time::Instant,
        callback: boxed_message::CompletionCallback,
        udata: Option<UserData>,
    ) -> Result<(), BusError> {
        if *self.shutdown_state.lock_or_panic() != ShutdownState::Running {
            return Err(BusError::Shutdown);
        }

        let conn = {
            let registry = self.registry.lock_or_panic();
            let (ok, v) = registry.get(fd);
            if !ok {
                return Err(BusError::UnregisteredSocket(fd));
            }
            Arc::clone(v.expect("checked ok above"))
        };

        // `fetch_max` both checks and commits atomically: if `seq_id` is
        // not strictly greater than the previous value, the stored value
        // is left unchanged (max of the two is still the previous value)
        // and the returned `largest` is `>= seq_id`, so the rejection
        // below still fires. This must happen before any `.await` so two
        // concurrent callers on the same fd can't both observe a stale
        // `largest` and both pass.
        let largest = conn
            .largest_wr_seq_id_seen
            .fetch_max(seq_id, Ordering::AcqRel);
        if seq_id <= largest {
            return Err(BusError::SeqIdRejected {
                fd,
                got: seq_id,
                largest,
            });
        }

        let boxed = boxed_message::BoxedMessage::new(fd, seq_id, bytes, deadline, callback, udata);
        let cmd_tx = self.listener_for(fd).cmd_tx.clone();
        sender::do_blocking_send(&conn, &cmd_tx, &self.threadpool, boxed).await?;
        Ok(())
    }

    /// Idempotent. Returns `false` (no side effects) unless the bus was
    /// `Running` when called.
    pub async fn shutdown(&self) -> bool {
        {
            let mut state = self.shutdown_state.lock_or_panic();
            if *state != ShutdownState::Running {
                return false;
            }
            *state = ShutdownState::ShuttingDown;
        }

        let mut drained = Vec::new();
        self.registry.lock_or_panic().free(|conn| drained.push(conn));
        for conn in drained {
            let mut writer = conn.writer.lock().await;
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await;
        }

        for handle in &self.listeners {
            let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
            let cmd = ListenerCommand::Shutdown {
                close_fds: true,
                ack: ack_tx,
            };
            let _ = handle.cmd_tx.send(cmd).await;
            let _ = ack_rx.await;
            if let Some(join) = handle.join.lock_or_panic().take() {
                let _ = join.await;
            }
        }

        *self.shutdown_state.lock_or_panic() = ShutdownState::Halted;
        true
    }

    /// Ensures the bus is halted, then force-shuts the thread-pool and
    /// drops the TLS context.
    pub async fn free(&self) {
        if *self.shutdown_state.lock_or_panic() != ShutdownState::Halted {
            self.shutdown().await;
        }
        self.threadpool.shutdown(true);
        if let Some(reaper) = self.died_reaper.lock_or_panic().take() {
            reaper.abort();
        }
    }

    /// A deadline `sender_timeout_ms` from now, per the configured
    /// default. Callers that don't need a tighter or looser bound for a
    /// particular request can pass this straight to `send_request`.
    pub fn default_deadline(&self) -> tokio::time::Instant {
        tokio::time::Instant::now() + Duration::from_millis(self.config.sender_timeout_ms)
    }

    /// Sleeps `bp >> backpressure_shift` milliseconds when `bp` is
    /// positive, pacing producers when the listener or thread-pool
    /// saturate.
    pub async fn backpressure_delay(&self, bp: usize) {
        let ms = (bp as u64) >> self.config.backpressure_shift;
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        } else if bp > 0 {
            warn!(bp, "nonzero backpressure rounded down to a zero delay");
        }
    }
}

trait LockOrPanic<T> {
    fn lock_or_panic(&self) -> std::sync::MutexGuard<'_, T>;
}

impl<T> LockOrPanic<T> for StdMutex<T> {
    /// The registry lock is held only across short, non-blocking
    /// operations, never across an `.await`, so recovering a poisoned
    /// lock here cannot observe a torn `FdTable`.
    fn lock_or_panic(&self) -> std::sync::MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
