// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `Session`'s default per-op methods are thin wrappers around `send`;
//! this checks they build the right `OpRequest` for each op without
//! needing a live bus.

use bytes::Bytes;
use kbp_client_rs::{
    client::session::Session,
    error::BusError,
    models::ops::{OpCode, OpRequest, OpResponse, OpStatus},
};

struct Captured(std::sync::Mutex<Option<OpRequest>>);

impl Session for Captured {
    async fn send(&self, req: OpRequest) -> Result<OpResponse, BusError> {
        let op = req.op;
        *self.0.lock().expect("capture mutex poisoned") = Some(req);
        Ok(OpResponse {
            op,
            status: OpStatus::Success,
            key: Bytes::new(),
            value: Bytes::new(),
        })
    }
}

fn run<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("current-thread runtime")
        .block_on(fut)
}

#[test]
fn get_builds_a_get_request() {
    let session = Captured(std::sync::Mutex::new(None));
    run(session.get(Bytes::from_static(b"my-key"))).expect("get succeeds");
    let req = session
        .0
        .lock()
        .expect("capture mutex poisoned")
        .take()
        .expect("send captured a request");
    assert_eq!(req.op, OpCode::Get);
    assert_eq!(&req.key[..], b"my-key");
}

#[test]
fn batch_packs_every_sub_request_length_prefixed() {
    let session = Captured(std::sync::Mutex::new(None));
    let ops = vec![
        OpRequest::put(Bytes::from_static(b"a"), Bytes::from_static(b"1")),
        OpRequest::delete(Bytes::from_static(b"bb")),
    ];
    run(session.batch(ops)).expect("batch succeeds");
    let req = session
        .0
        .lock()
        .expect("capture mutex poisoned")
        .take()
        .expect("send captured a request");
    assert_eq!(req.op, OpCode::Batch);

    let mut expected = Vec::new();
    expected.extend_from_slice(&1u32.to_be_bytes());
    expected.extend_from_slice(b"a");
    expected.extend_from_slice(&1u32.to_be_bytes());
    expected.extend_from_slice(b"1");
    expected.extend_from_slice(&2u32.to_be_bytes());
    expected.extend_from_slice(b"bb");
    expected.extend_from_slice(&0u32.to_be_bytes());
    assert_eq!(&req.value[..], &expected[..]);
}

#[test]
fn no_op_carries_no_key_or_value() {
    let session = Captured(std::sync::Mutex::new(None));
    run(session.no_op()).expect("no_op succeeds");
    let req = session
        .0
        .lock()
        .expect("capture mutex poisoned")
        .take()
        .expect("send captured a request");
    assert_eq!(req.op, OpCode::NoOp);
    assert!(req.key.is_empty());
    assert!(req.value.is_empty());
}
