// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The device's request/response surface, reduced to marker types.
//!
//! The real wire bodies are protobuf messages an external `Builder`
//! produces; this module only fixes the operation tags the bus needs to
//! stay opaque to and a `seq_id`-bearing envelope shape the crate's own
//! tests and examples can build against without pulling in a real
//! device's protobuf definitions.

use bytes::Bytes;

/// Every operation the device's request/response surface exposes.
/// `Batch` wraps a list of non-batch ops submitted as one wire message,
/// mirroring the source's batch put/get variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Put = 0x01,
    Get = 0x02,
    GetNext = 0x03,
    GetPrevious = 0x04,
    Delete = 0x05,
    GetKeyRange = 0x06,
    GetLog = 0x07,
    Flush = 0x08,
    NoOp = 0x09,
    P2P = 0x0A,
    Batch = 0x0B,
}

/// A request envelope: the operation being performed, the key (or range
/// start) it addresses, and an opaque value payload. Batch requests reuse
/// this shape with `op = OpCode::Batch` and one entry per sub-operation
/// packed into `value` by the `Builder`.
#[derive(Debug, Clone)]
pub struct OpRequest {
    pub op: OpCode,
    pub key: Bytes,
    pub value: Bytes,
}

impl OpRequest {
    pub fn new(op: OpCode, key: Bytes, value: Bytes) -> Self {
        OpRequest { op, key, value }
    }

    pub fn nop() -> Self {
        OpRequest::new(OpCode::NoOp, Bytes::new(), Bytes::new())
    }

    pub fn get(key: Bytes) -> Self {
        OpRequest::new(OpCode::Get, key, Bytes::new())
    }

    pub fn put(key: Bytes, value: Bytes) -> Self {
        OpRequest::new(OpCode::Put, key, value)
    }

    pub fn delete(key: Bytes) -> Self {
        OpRequest::new(OpCode::Delete, key, Bytes::new())
    }
}

/// Decoded response: the status the device reported plus whatever
/// key/value it returned, if any (empty for `Delete`/`Flush`/`NoOp`).
#[derive(Debug, Clone)]
pub struct OpResponse {
    pub op: OpCode,
    pub status: OpStatus,
    pub key: Bytes,
    pub value: Bytes,
}

/// Device-reported outcome of a single operation. Distinct from
/// [`crate::error::CompletionStatus`], which covers bus-level delivery
/// outcomes (timeout, shutdown, ...); `OpStatus` is what the device itself
/// said about the operation once a response was actually delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Success,
    NotFound,
    VersionMismatch,
    DeviceBusy,
    InvalidRequest,
}

/// Produces the outbound bytes for an [`OpRequest`] and chooses its
/// `seq_id`. An external collaborator — this crate only consumes the
/// trait; a real device's protocol-buffer encoding and HMAC signing live
/// in the caller's implementation.
pub trait Builder: Send + Sync {
    /// Allocates the next `seq_id` to submit on `fd`. Must return strictly
    /// increasing values per fd.
    fn next_seq_id(&self, fd: std::os::fd::RawFd) -> u64;

    /// Serializes `req` (and the `seq_id` `next_seq_id` just produced)
    /// into the bytes [`crate::bus::Bus::send_request`] writes to the
    /// wire.
    fn encode(&self, seq_id: u64, req: &OpRequest) -> Bytes;
}
