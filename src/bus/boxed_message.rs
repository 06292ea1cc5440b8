// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The lifecycle object for one outstanding request: a `BoxedMessage` is
//! created by [`crate::bus::Bus::send_request`], handed to the
//! [`crate::sender`] for the blocking write, transferred to the owning
//! [`crate::listener::Listener`] on write-complete, and finally consumed
//! by the thread-pool when its completion callback runs.
//!
//! Ownership is expressed by value rather than by a reference count: the
//! struct moves from component to component, and whichever component
//! currently holds it is the only one that may touch it — never shared
//! or aliased while in flight.

use std::os::fd::RawFd;

use bytes::Bytes;
use tokio::time::Instant;

use crate::{codec::UnpackedMessage, error::CompletionStatus};

/// Opaque data the caller attaches to a request and gets back verbatim in
/// its completion callback.
pub type UserData = Box<dyn std::any::Any + Send>;

/// What a request's completion callback receives: either the decoded
/// response, or a terminal failure status.
pub struct CompletionResult {
    pub status: CompletionStatus,
    pub message: Option<UnpackedMessage>,
    pub udata: Option<UserData>,
}

impl CompletionResult {
    pub fn ok(message: UnpackedMessage, udata: Option<UserData>) -> Self {
        CompletionResult {
            status: CompletionStatus::Ok,
            message: Some(message),
            udata,
        }
    }

    pub fn failed(status: CompletionStatus, udata: Option<UserData>) -> Self {
        debug_assert!(status != CompletionStatus::Ok);
        CompletionResult {
            status,
            message: None,
            udata,
        }
    }
}

/// A completion callback: run exactly once, on the thread-pool, never on
/// a listener task.
pub type CompletionCallback = Box<dyn FnOnce(CompletionResult) + Send + 'static>;

/// One outstanding request, from the moment `send_request` boxes it until
/// its completion callback consumes it.
pub struct BoxedMessage {
    pub fd: RawFd,
    pub seq_id: u64,
    pub bytes: Bytes,
    pub sent: usize,
    pub deadline: Instant,
    pub callback: CompletionCallback,
    pub udata: Option<UserData>,
}

impl BoxedMessage {
    pub fn new(
        fd: RawFd,
        seq_id: u64,
        bytes: Bytes,
        deadline: Instant,
        callback: CompletionCallback,
        udata: Option<UserData>,
    ) -> Self {
        BoxedMessage {
            fd,
            seq_id,
            bytes,
            sent: 0,
            deadline,
            callback,
            udata,
        }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.bytes[self.sent..]
    }

    /// Consumes the message, invoking its callback with `result`. The only
    /// way a `BoxedMessage`'s callback may run — there is no path that
    /// drops one without completing it.
    pub fn complete(self, mut result: CompletionResult) {
        if result.udata.is_none() {
            result.udata = self.udata;
        }
        (self.callback)(result);
    }
}
