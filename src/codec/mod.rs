// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The pluggable codec contract: a `Sink`/`Unpack` pair that the listener
//! drives against an arbitrary byte stream. The bus owns no framing logic
//! of its own beyond what [`SocketInfo`] tracks; everything about how many
//! bytes form a complete message is delegated to the caller-supplied
//! `Sink`, and turning the accumulated bytes into a decoded message with a
//! `seq_id` is delegated to `Unpack`. [`framing`] ships a default
//! implementation of a 9-byte length-prefixed header framing.

pub mod framing;

use std::any::Any;

use bytes::BytesMut;

/// Per-message length ceiling for both the protobuf and value segments,
/// per the wire format's header limits.
pub const PROTO_MAX: usize = 1024 * 1024;

/// Read-side state machine driven by a [`Sink`] as bytes arrive on a
/// socket. One instance lives per registered socket, owned by that
/// socket's read-pump task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Uninit,
    AwaitingHeader,
    AwaitingBody,
}

/// Outcome of the most recent header parse attempt, surfaced to `Unpack`
/// so it can tell a well-formed frame from a framing violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackStatus {
    Success,
    Undefined,
    InvalidHeader,
    PayloadAllocFail,
}

/// The accumulator `Sink::feed` mutates and the buffer `Unpack::unpack`
/// reads from once a full frame (or a framing error worth surfacing) is
/// ready. Exactly one of these exists per registered socket.
#[derive(Debug)]
pub struct SocketInfo {
    pub state: SocketState,
    pub accumulated: usize,
    pub unpack_status: UnpackStatus,
    /// Bytes collected for the frame segment currently in flight (the
    /// header while `AwaitingHeader`, the body while `AwaitingBody`).
    /// Left untouched across the `Sink::feed` call that completes a frame
    /// so `Unpack::unpack` can still read it; cleared lazily at the start
    /// of the next `feed` call.
    pub buf: BytesMut,
    /// Raw bytes of the most recently parsed fixed header, kept around
    /// after `accumulated` resets so `Unpack` can still inspect it (in
    /// particular to report `InvalidHeader`).
    pub header_snapshot: [u8; 9],
    /// `protobuf_length` from the most recently parsed valid header.
    pub proto_len: u32,
    /// `value_length` from the most recently parsed valid header.
    pub value_len: u32,
}

impl Default for SocketInfo {
    fn default() -> Self {
        SocketInfo {
            state: SocketState::Uninit,
            accumulated: 0,
            unpack_status: UnpackStatus::Undefined,
            buf: BytesMut::new(),
            header_snapshot: [0u8; 9],
            proto_len: 0,
            value_len: 0,
        }
    }
}

/// What the listener should do after feeding a chunk of bytes into a
/// [`Sink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Keep reading; request at least `next_read` more bytes.
    NeedMore(usize),
    /// A frame (or framing error) is ready in `SocketInfo`; call
    /// `Unpack::unpack` next. `next_read` is the size to request for the
    /// frame that follows.
    FullMessage { next_read: usize },
}

/// A pluggable framer: turns a stream of bytes into discrete frames
/// without knowing anything about their payload format.
pub trait Sink: Send + Sync {
    /// The number of bytes to request from the transport before the very
    /// first call to `feed` for a freshly registered socket.
    fn initial_read_size(&self) -> usize;

    /// Feed up to `chunk.len()` new bytes into `info`. Returns how many
    /// bytes of `chunk` were consumed (always `> 0` for non-empty input)
    /// and what the caller should do next.
    fn feed(&self, info: &mut SocketInfo, chunk: &[u8]) -> (usize, SinkOutcome);
}

/// A message decoded by [`Unpack::unpack`], tagged with the `seq_id` the
/// listener uses to match it to an outstanding request.
pub struct UnpackedMessage {
    pub seq_id: u64,
    pub message: Box<dyn Any + Send>,
}

/// A framing-level or payload-level decode failure. `opaque_error_id` is
/// surfaced verbatim to the bus's unexpected-message hook when no
/// outstanding request matches `seq_id`.
///
/// `seq_id` is `Some` whenever the header (and therefore the request this
/// response belongs to) was already identified before the failure — a
/// malformed body past that point can still be routed back to the
/// waiting caller as `BadResponse` instead of falling through to the
/// unexpected-message path. It is `None` when the failure happens before
/// a `seq_id` could be recovered at all (an invalid header, or a body too
/// short to carry one).
#[derive(Debug, Clone)]
pub struct UnpackError {
    pub opaque_error_id: i64,
    pub detail: String,
    pub seq_id: Option<u64>,
}

impl std::fmt::Display for UnpackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unpack error {}: {}", self.opaque_error_id, self.detail)
    }
}

impl std::error::Error for UnpackError {}

/// Turns a completed frame (or framing error) held in [`SocketInfo`] into
/// a decoded message plus its `seq_id`.
pub trait Unpack: Send + Sync {
    fn unpack(&self, info: &mut SocketInfo) -> Result<UnpackedMessage, UnpackError>;
}
