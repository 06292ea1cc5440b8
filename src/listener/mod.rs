// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One Listener instance per `listener_count` configured on the bus. Each
//! runs as its own `tokio::task`, the cooperative-task analogue of a
//! dedicated OS thread per listener. A Listener never shares state with
//! another Listener; every mutation arrives as a command over its own
//! channel.

pub mod command;
mod read_pump;

use std::{
    collections::HashMap,
    os::fd::RawFd,
    sync::{Arc, atomic::AtomicUsize},
    time::Duration,
};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, warn};

pub use command::ListenerCommand;
use read_pump::ReadPumpEvent;

use crate::{
    bus::boxed_message::BoxedMessage,
    codec::{Sink, Unpack},
    error::CompletionStatus,
    threadpool::ThreadPool,
};

struct Expectation {
    deadline: Instant,
    msg: BoxedMessage,
}

struct SocketHandle {
    task: JoinHandle<()>,
}

/// Per-listener runtime state. Constructed by [`crate::bus::Bus::init`]
/// and immediately handed to a spawned task running [`Listener::run`].
pub struct Listener {
    index: usize,
    cmd_rx: mpsc::Receiver<ListenerCommand>,
    events_tx: mpsc::UnboundedSender<ReadPumpEvent>,
    events_rx: mpsc::UnboundedReceiver<ReadPumpEvent>,
    sockets: HashMap<RawFd, SocketHandle>,
    expectations: HashMap<(RawFd, u64), Expectation>,
    sink: Arc<dyn Sink>,
    unpack: Arc<dyn Unpack>,
    threadpool: Arc<ThreadPool>,
    unexpected_msg_cb: Option<Arc<dyn Fn(RawFd, i64) + Send + Sync>>,
    died_notify: mpsc::UnboundedSender<RawFd>,
    shutting_down: bool,
    /// Most recent thread-pool queue depth observed while delivering a
    /// response, shared with every owned read-pump task so each can pace
    /// its own reads once it crosses [`read_pump::POLL_THROTTLE_THRESHOLD`].
    backpressure: Arc<AtomicUsize>,
    backpressure_shift: u32,
}

impl Listener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        cmd_rx: mpsc::Receiver<ListenerCommand>,
        sink: Arc<dyn Sink>,
        unpack: Arc<dyn Unpack>,
        threadpool: Arc<ThreadPool>,
        unexpected_msg_cb: Option<Arc<dyn Fn(RawFd, i64) + Send + Sync>>,
        died_notify: mpsc::UnboundedSender<RawFd>,
        backpressure_shift: u32,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Listener {
            index,
            cmd_rx,
            events_tx,
            events_rx,
            sockets: HashMap::new(),
            expectations: HashMap::new(),
            sink,
            unpack,
            threadpool,
            unexpected_msg_cb,
            died_notify,
            shutting_down: false,
            backpressure: Arc::new(AtomicUsize::new(0)),
            backpressure_shift,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Drives the listener until a `Shutdown` command is processed and
    /// every owned socket and expectation has drained.
    pub async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                },

                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {},
                    }
                },

                _ = tokio::time::sleep_until(deadline) => {
                    self.scan_timeouts();
                },
            }

            if self.shutting_down && self.sockets.is_empty() && self.expectations.is_empty() {
                break;
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        self.expectations
            .values()
            .map(|e| e.deadline)
            .min()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
    }

    async fn handle_command(&mut self, cmd: ListenerCommand) {
        match cmd {
            ListenerCommand::AddSocket { conn, reader, ack } => {
                if self.shutting_down {
                    let _ = ack.send(false);
                    return;
                }
                let fd = conn.fd;
                let task = tokio::spawn(read_pump::run(
                    fd,
                    reader,
                    Arc::clone(&self.sink),
                    Arc::clone(&self.unpack),
                    self.events_tx.clone(),
                    Arc::clone(&self.backpressure),
                    self.backpressure_shift,
                ));
                self.sockets.insert(fd, SocketHandle { task });
                let _ = ack.send(true);
            },

            ListenerCommand::RemoveSocket { fd, ack } => {
                if let Some(handle) = self.sockets.remove(&fd) {
                    handle.task.abort();
                }
                self.fail_expectations_for(fd, CompletionStatus::Shutdown);
                let _ = ack.send(true);
            },

            ListenerCommand::ExpectResponse {
                fd,
                seq_id,
                deadline,
                msg,
            } => {
                if self.shutting_down {
                    self.dispatch_completion(
                        msg,
                        crate::bus::boxed_message::CompletionResult::failed(
                            CompletionStatus::Shutdown,
                            None,
                        ),
                    );
                    return;
                }
                self.expectations
                    .insert((fd, seq_id), Expectation { deadline, msg });
            },

            ListenerCommand::Shutdown { close_fds: _, ack } => {
                // Aborting a read-pump task drops its `ReadHalf`, which in
                // turn drops the socket's only remaining half once the
                // writer side (held by `ConnectionInfo`) is also dropped
                // by the Bus during `free`. There is currently no path to
                // hand a live fd back to the caller instead of closing
                // it, so `close_fds = false` is accepted but not yet
                // honored distinctly.
                self.shutting_down = true;
                for (_fd, handle) in self.sockets.drain() {
                    handle.task.abort();
                }
                let fds: Vec<(RawFd, u64)> = self.expectations.keys().copied().collect();
                for key in fds {
                    if let Some(exp) = self.expectations.remove(&key) {
                        self.dispatch_completion(
                            exp.msg,
                            crate::bus::boxed_message::CompletionResult::failed(
                                CompletionStatus::Shutdown,
                                None,
                            ),
                        );
                    }
                }
                let _ = ack.send(true);
            },
        }
    }

    fn handle_event(&mut self, event: ReadPumpEvent) {
        match event {
            ReadPumpEvent::Frame { fd, result } => match result {
                Ok(msg) => self.route_message(fd, msg),
                Err(err) => {
                    let matched = err
                        .seq_id
                        .and_then(|seq_id| self.expectations.remove(&(fd, seq_id)));
                    if let Some(exp) = matched {
                        debug!(fd, seq_id = err.seq_id, error = %err, "malformed response body, completing as bad response");
                        self.dispatch_completion(
                            exp.msg,
                            crate::bus::boxed_message::CompletionResult::failed(
                                CompletionStatus::BadResponse,
                                None,
                            ),
                        );
                        return;
                    }
                    debug!(fd, error = %err, "decode failure, routing to unexpected-message hook");
                    if let Some(cb) = &self.unexpected_msg_cb {
                        cb(fd, err.opaque_error_id);
                    } else {
                        warn!(fd, error = %err, "dropping undecodable frame");
                    }
                },
            },
            ReadPumpEvent::Died { fd } => {
                self.sockets.remove(&fd);
                self.fail_expectations_for(fd, CompletionStatus::RxFailure);
                let _ = self.died_notify.send(fd);
            },
        }
    }

    fn route_message(&mut self, fd: RawFd, msg: crate::codec::UnpackedMessage) {
        let key = (fd, msg.seq_id);
        match self.expectations.remove(&key) {
            Some(exp) => {
                let seq_id = key.1;
                self.dispatch_completion(
                    exp.msg,
                    crate::bus::boxed_message::CompletionResult::ok(msg, None),
                );
                debug!(fd, seq_id, "delivered response");
            },
            None => {
                if let Some(cb) = &self.unexpected_msg_cb {
                    cb(fd, -1);
                } else {
                    warn!(fd, seq_id = key.1, "unsolicited message, dropping");
                }
            },
        }
    }

    fn fail_expectations_for(&mut self, fd: RawFd, status: CompletionStatus) {
        let keys: Vec<(RawFd, u64)> = self
            .expectations
            .keys()
            .filter(|(k_fd, _)| *k_fd == fd)
            .copied()
            .collect();
        for key in keys {
            if let Some(exp) = self.expectations.remove(&key) {
                self.dispatch_completion(
                    exp.msg,
                    crate::bus::boxed_message::CompletionResult::failed(status, None),
                );
            }
        }
    }

    fn scan_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<(RawFd, u64)> = self
            .expectations
            .iter()
            .filter(|(_, exp)| exp.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some(exp) = self.expectations.remove(&key) {
                self.dispatch_completion(
                    exp.msg,
                    crate::bus::boxed_message::CompletionResult::failed(
                        CompletionStatus::Timeout,
                        None,
                    ),
                );
            }
        }
    }

    /// Hands `msg` to the thread-pool to complete with `result`, the only
    /// path by which a [`BoxedMessage`] callback runs — never inline on
    /// this listener's own task, per `CompletionCallback`'s contract.
    fn dispatch_completion(
        &self,
        msg: BoxedMessage,
        result: crate::bus::boxed_message::CompletionResult,
    ) {
        let bp = self.threadpool.submit(move || {
            msg.complete(result);
        });
        self.backpressure
            .store(bp, std::sync::atomic::Ordering::Relaxed);
    }
}
