// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error kinds surfaced across the bus's public API.
//!
//! [`BusError`] covers everything returned synchronously (registration,
//! `send_request` rejections, fatal init failures). [`CompletionStatus`]
//! covers everything delivered later, through a request's completion
//! callback, once a response (or a terminal failure) for it is known.

use thiserror::Error;

/// Errors returned synchronously from the bus's public operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("fd {0} is not registered with this bus")]
    UnregisteredSocket(i32),

    #[error("seq_id {got} rejected for fd {fd}: largest accepted so far is {largest}")]
    SeqIdRejected { fd: i32, got: u64, largest: u64 },

    #[error("bus is shutting down or halted")]
    Shutdown,

    #[error("allocation or boxing failure: {0}")]
    Memory(String),

    #[error("sender gave up before the deadline: {0}")]
    SendTimeout(String),

    #[error("fatal initialization failure: {0}")]
    Fatal(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] crate::tls::TlsError),
}

/// Outcome delivered to a request's completion callback.
///
/// `Ok` carries the decoded message; every other variant is terminal and
/// carries no message. `UnregisteredSocket`/`SeqIdRejected` never appear
/// here since those are always rejected synchronously by `send_request`
/// before a request is ever handed to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Ok,
    Timeout,
    TxFailure,
    RxFailure,
    BadResponse,
    Shutdown,
    Memory,
}

impl CompletionStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, CompletionStatus::Ok)
    }
}
