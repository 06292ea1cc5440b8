// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Commands a [`crate::bus::Bus`] or [`crate::sender`] sends to a
//! [`super::Listener`]'s control channel: a bounded `mpsc` channel
//! carrying these variants, each (save `ExpectResponse`, which is
//! fire-and-forget once the write completes) paired with a one-shot
//! acknowledgement channel the sender awaits for the outcome.

use std::os::fd::RawFd;

use tokio::{io::ReadHalf, sync::oneshot, time::Instant};

use crate::{bus::boxed_message::BoxedMessage, registry::ConnectionInfo, tls::Transport};

pub type Ack = oneshot::Sender<bool>;

pub enum ListenerCommand {
    AddSocket {
        conn: std::sync::Arc<ConnectionInfo>,
        reader: ReadHalf<Transport>,
        ack: Ack,
    },
    RemoveSocket {
        fd: RawFd,
        ack: Ack,
    },
    ExpectResponse {
        fd: RawFd,
        seq_id: u64,
        deadline: Instant,
        msg: BoxedMessage,
    },
    Shutdown {
        close_fds: bool,
        ack: Ack,
    },
}
