// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The blocking write path: one call per outstanding request, with
//! fairness between concurrent senders on the same socket enforced by
//! holding that socket's writer mutex for the duration of the write.
//!
//! A single `tokio::time::timeout` wraps the whole write-to-completion
//! call rather than per-`poll` retries, since `tokio::io::AsyncWriteExt`
//! already retries partial writes internally via `write_all`.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{
    bus::boxed_message::{BoxedMessage, CompletionResult},
    error::{BusError, CompletionStatus},
    listener::ListenerCommand,
    registry::ConnectionInfo,
    threadpool::ThreadPool,
};

/// Writes `boxed`'s outbound bytes to `conn`'s socket, then hands it off
/// to the owning listener to await its response.
///
/// On success, an `ExpectResponse` command is enqueued on `cmd_tx` and
/// `Ok(())` is returned. On deadline miss or write failure, `boxed` is
/// completed as `TxFailure` (or `Timeout`, if the sender gave up before
/// the write finished) on `threadpool` — never inline on the caller's own
/// task — and released back to the caller as a failure; it is never
/// enqueued on a failed send.
pub async fn do_blocking_send(
    conn: &Arc<ConnectionInfo>,
    cmd_tx: &tokio::sync::mpsc::Sender<ListenerCommand>,
    threadpool: &Arc<ThreadPool>,
    mut boxed: BoxedMessage,
) -> Result<(), BusError> {
    let deadline = boxed.deadline;
    let fd = conn.fd;
    let seq_id = boxed.seq_id;

    let mut writer = conn.writer.lock().await;

    let write_result =
        tokio::time::timeout_at(deadline, writer.write_all(boxed.remaining())).await;

    match write_result {
        Ok(Ok(())) => {
            boxed.sent = boxed.bytes.len();
            drop(writer);

            let cmd = ListenerCommand::ExpectResponse {
                fd,
                seq_id,
                deadline,
                msg: boxed,
            };
            if cmd_tx.send(cmd).await.is_err() {
                warn!(fd, seq_id, "listener command channel closed after send");
                return Err(BusError::Shutdown);
            }
            debug!(fd, seq_id, "request sent, awaiting response");
            Ok(())
        },
        Ok(Err(io_err)) => {
            warn!(fd, seq_id, error = %io_err, "write failed");
            threadpool.submit(move || {
                boxed.complete(CompletionResult::failed(CompletionStatus::TxFailure, None));
            });
            Err(BusError::Io(io_err))
        },
        Err(_elapsed) => {
            warn!(fd, seq_id, "sender deadline elapsed before write completed");
            threadpool.submit(move || {
                boxed.complete(CompletionResult::failed(CompletionStatus::Timeout, None));
            });
            Err(BusError::SendTimeout(format!(
                "fd {fd} seq_id {seq_id} deadline elapsed"
            )))
        },
    }
}
