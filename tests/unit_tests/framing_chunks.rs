// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Feeds a single valid frame into `FramingSink` split into arbitrary
//! chunk sizes and checks that the total bytes consumed across every
//! `feed` call equals exactly `9 + protobuf_length + value_length`,
//! regardless of how the stream was chunked.

use kbp_client_rs::codec::{Sink, SinkOutcome, SocketInfo};

fn build_frame(proto: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + proto.len() + value.len());
    out.push(0xA0);
    out.extend_from_slice(&(proto.len() as u32).to_be_bytes());
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(proto);
    out.extend_from_slice(value);
    out
}

fn feed_in_chunks(frame: &[u8], chunk_sizes: &[usize]) -> usize {
    let sink = kbp_client_rs::codec::framing::FramingSink;
    let mut info = SocketInfo::default();
    let mut offset = 0;
    let mut total_consumed = 0;
    let mut sizes = chunk_sizes.iter().cycle();

    loop {
        let size = *sizes.next().expect("cycle never ends");
        let end = (offset + size).min(frame.len());
        if offset >= frame.len() {
            break;
        }
        let (consumed, outcome) = sink.feed(&mut info, &frame[offset..end]);
        total_consumed += consumed;
        offset += consumed;
        if let SinkOutcome::FullMessage { .. } = outcome {
            break;
        }
    }
    total_consumed
}

#[test]
fn total_consumed_matches_frame_size_for_varied_chunking() {
    let mut seq_id = 7u64.to_be_bytes().to_vec();
    seq_id.extend_from_slice(b"proto-tail");
    let proto = seq_id;
    let value = b"some opaque value bytes, a bit longer than the header".to_vec();
    let frame = build_frame(&proto, &value);
    let expected = frame.len();

    for chunk_sizes in [
        &[1usize][..],
        &[2, 3][..],
        &[5, 1, 7][..],
        &[1000][..],
        &[3, 3, 3, 3, 3][..],
    ] {
        let consumed = feed_in_chunks(&frame, chunk_sizes);
        assert_eq!(consumed, expected, "chunking {chunk_sizes:?} dropped bytes");
    }
}

#[test]
fn single_byte_chunks_still_reassemble_exactly() {
    let mut proto = 99u64.to_be_bytes().to_vec();
    proto.extend_from_slice(b"x");
    let value = b"v".to_vec();
    let frame = build_frame(&proto, &value);

    let consumed = feed_in_chunks(&frame, &[1]);
    assert_eq!(consumed, frame.len());
}
