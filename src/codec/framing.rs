// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Default implementation of the wire format: a 9-byte header (1-byte
//! version prefix + 4-byte big-endian protobuf length + 4-byte big-endian
//! value length) followed by `protobuf_length` bytes of command message
//! and `value_length` bytes of opaque value.
//!
//! The 9-byte header and the two length-prefixed segments that follow it
//! are bit-exact to the wire format; decoding the `protobuf_length`
//! segment into an actual command message is an external concern (the
//! real protocol-buffer message definitions are out of scope for this
//! crate). [`FramingUnpack`] instead uses a minimal convention so the
//! default codec is runnable standalone: the first 8 bytes of the
//! protobuf segment are a big-endian `seq_id`, and the remainder is
//! opaque. Callers that speak a real device's protocol supply their own
//! [`Unpack`] and reuse only [`FramingSink`] for the framing.

use bytes::Bytes;

use crate::codec::{
    PROTO_MAX, Sink, SinkOutcome, SocketInfo, SocketState, Unpack, UnpackError,
    UnpackStatus, UnpackedMessage,
};

/// Length of the fixed header: 1 (version) + 4 (protobuf length) + 4
/// (value length).
pub const HEADER_LEN: usize = 9;

/// Required value of the header's first byte.
pub const VERSION_PREFIX: u8 = 0xA0;

/// A decoded frame produced by [`FramingUnpack`]: the raw protobuf-length
/// segment (minus the leading 8-byte `seq_id` convention) and the raw
/// value segment, both zero-copy slices of the socket's read buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq_id: u64,
    pub proto: Bytes,
    pub value: Bytes,
}

/// Splits an incoming byte stream into 9-byte-header-prefixed frames per
/// the wire format. Stateless; all mutable state lives in the
/// [`SocketInfo`] passed to `feed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FramingSink;

impl Sink for FramingSink {
    fn initial_read_size(&self) -> usize {
        HEADER_LEN
    }

    fn feed(&self, info: &mut SocketInfo, chunk: &[u8]) -> (usize, SinkOutcome) {
        if info.state == SocketState::Uninit {
            info.state = SocketState::AwaitingHeader;
        }
        if info.accumulated == 0 {
            info.buf.clear();
        }

        let target = match info.state {
            SocketState::AwaitingHeader => HEADER_LEN,
            SocketState::AwaitingBody => {
                info.proto_len as usize + info.value_len as usize
            },
            SocketState::Uninit => unreachable!("reset to AwaitingHeader above"),
        };

        let need = target - info.accumulated;
        let take = need.min(chunk.len());
        info.buf.extend_from_slice(&chunk[..take]);
        info.accumulated += take;

        if info.accumulated < target {
            return (take, SinkOutcome::NeedMore(target - info.accumulated));
        }

        match info.state {
            SocketState::AwaitingHeader => {
                info.header_snapshot.copy_from_slice(&info.buf[..HEADER_LEN]);
                let version = info.header_snapshot[0];
                let proto_len = u32::from_be_bytes(
                    info.header_snapshot[1..5]
                        .try_into()
                        .expect("slice is exactly 4 bytes"),
                );
                let value_len = u32::from_be_bytes(
                    info.header_snapshot[5..9]
                        .try_into()
                        .expect("slice is exactly 4 bytes"),
                );

                let valid = version == VERSION_PREFIX
                    && (proto_len as usize) <= PROTO_MAX
                    && (value_len as usize) <= PROTO_MAX;

                if !valid {
                    info.unpack_status = UnpackStatus::InvalidHeader;
                    info.state = SocketState::AwaitingHeader;
                    info.accumulated = 0;
                    return (take, SinkOutcome::FullMessage {
                        next_read: HEADER_LEN,
                    });
                }

                info.unpack_status = UnpackStatus::Success;
                info.proto_len = proto_len;
                info.value_len = value_len;
                info.state = SocketState::AwaitingBody;
                info.accumulated = 0;

                let body_target = proto_len as usize + value_len as usize;
                if body_target == 0 {
                    info.state = SocketState::AwaitingHeader;
                    return (take, SinkOutcome::FullMessage {
                        next_read: HEADER_LEN,
                    });
                }
                (take, SinkOutcome::NeedMore(body_target))
            },
            SocketState::AwaitingBody => {
                info.state = SocketState::AwaitingHeader;
                info.accumulated = 0;
                (take, SinkOutcome::FullMessage {
                    next_read: HEADER_LEN,
                })
            },
            SocketState::Uninit => unreachable!(),
        }
    }
}

/// Decodes frames accumulated by [`FramingSink`] using the `seq_id`
/// convention documented on the module.
#[derive(Debug, Default, Clone, Copy)]
pub struct FramingUnpack;

impl Unpack for FramingUnpack {
    fn unpack(&self, info: &mut SocketInfo) -> Result<UnpackedMessage, UnpackError> {
        if info.unpack_status == UnpackStatus::InvalidHeader {
            return Err(UnpackError {
                opaque_error_id: info.header_snapshot[0] as i64,
                detail: format!(
                    "invalid header: version={:#04x} proto_len={} value_len={}",
                    info.header_snapshot[0],
                    u32::from_be_bytes(
                        info.header_snapshot[1..5]
                            .try_into()
                            .expect("slice is exactly 4 bytes")
                    ),
                    u32::from_be_bytes(
                        info.header_snapshot[5..9]
                            .try_into()
                            .expect("slice is exactly 4 bytes")
                    ),
                ),
                // The header itself is the part that's malformed, so no
                // seq_id can be recovered to route this back to a caller.
                seq_id: None,
            });
        }

        let total = info.proto_len as usize + info.value_len as usize;
        if info.buf.len() < total {
            return Err(UnpackError {
                opaque_error_id: -1,
                detail: "unpack called before body fully accumulated".to_string(),
                seq_id: None,
            });
        }

        let proto_all = info.buf.split_to(info.proto_len as usize).freeze();
        let value = info.buf.split_to(info.value_len as usize).freeze();

        if proto_all.len() < 8 {
            return Err(UnpackError {
                opaque_error_id: -2,
                detail: "protobuf segment too short to carry a seq_id".to_string(),
                seq_id: None,
            });
        }
        let seq_id = u64::from_be_bytes(
            proto_all[..8]
                .try_into()
                .expect("checked len >= 8 above"),
        );
        let proto = proto_all.slice(8..);

        Ok(UnpackedMessage {
            seq_id,
            message: Box::new(Frame {
                seq_id,
                proto,
                value,
            }),
        })
    }
}
