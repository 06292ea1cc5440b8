// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One task per registered socket, driving the [`Sink`]/[`Unpack`] codec
//! contract against that socket's bytes and reporting decoded frames (or
//! terminal failures) back to the owning [`super::Listener`].
//!
//! Instead of a single thread calling `poll` across every socket it owns
//! and stepping each one's state machine inline, each socket gets its own
//! `tokio::task` suspended in `AsyncRead::read`; the read-side state
//! machine the codec drives is unchanged, just driven here instead of
//! from a shared poll loop.

use std::{
    os::fd::RawFd,
    sync::{Arc, atomic::{AtomicUsize, Ordering}},
    time::Duration,
};

use tokio::{io::{AsyncReadExt, ReadHalf}, sync::mpsc};

use crate::{
    codec::{Sink, SinkOutcome, SocketInfo, Unpack, UnpackError, UnpackedMessage},
    tls::Transport,
};

/// Once the owning listener's last-observed thread-pool queue depth
/// exceeds this, the read-pump inserts a pacing delay before its next
/// read so a saturated callback pool isn't handed more work than it can
/// drain.
pub const POLL_THROTTLE_THRESHOLD: usize = 8;

/// Reported to the owning listener as frames are decoded or the socket
/// dies.
pub enum ReadPumpEvent {
    Frame {
        fd: RawFd,
        result: Result<UnpackedMessage, UnpackError>,
    },
    Died {
        fd: RawFd,
    },
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    fd: RawFd,
    mut reader: ReadHalf<Transport>,
    sink: Arc<dyn Sink>,
    unpack: Arc<dyn Unpack>,
    events_tx: mpsc::UnboundedSender<ReadPumpEvent>,
    backpressure: Arc<AtomicUsize>,
    backpressure_shift: u32,
) {
    let mut info = SocketInfo::default();
    let mut want = sink.initial_read_size();
    let mut chunk = vec![0u8; want.max(1)];

    loop {
        let bp = backpressure.load(Ordering::Relaxed);
        if bp > POLL_THROTTLE_THRESHOLD {
            let delay_ms = (bp as u64) >> backpressure_shift;
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        if chunk.len() < want {
            chunk.resize(want, 0);
        }
        let n = match reader.read(&mut chunk[..want.max(1)]).await {
            Ok(0) => {
                let _ = events_tx.send(ReadPumpEvent::Died { fd });
                return;
            },
            Ok(n) => n,
            Err(_) => {
                let _ = events_tx.send(ReadPumpEvent::Died { fd });
                return;
            },
        };

        let mut offset = 0;
        while offset < n {
            let (consumed, outcome) = sink.feed(&mut info, &chunk[offset..n]);
            offset += consumed;
            match outcome {
                SinkOutcome::NeedMore(next_read) => {
                    want = next_read;
                },
                SinkOutcome::FullMessage { next_read } => {
                    let result = unpack.unpack(&mut info);
                    if events_tx
                        .send(ReadPumpEvent::Frame { fd, result })
                        .is_err()
                    {
                        return;
                    }
                    want = next_read;
                },
            }
        }
    }
}
