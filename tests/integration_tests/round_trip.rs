// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use kbp_client_rs::codec::framing::Frame;
use serial_test::serial;

use crate::integration_tests::common::{connect, plain, spawn_echo_server, test_bus};

fn encode(seq_id: u64, payload: &[u8]) -> Bytes {
    let mut proto = seq_id.to_be_bytes().to_vec();
    proto.extend_from_slice(b"tag");
    let mut out = Vec::with_capacity(9 + proto.len() + payload.len());
    out.push(0xA0);
    out.extend_from_slice(&(proto.len() as u32).to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&proto);
    out.extend_from_slice(payload);
    Bytes::from(out)
}

#[tokio::test]
#[serial]
async fn echoed_response_carries_matching_seq_id_and_payload() -> Result<()> {
    let bus = test_bus(2_000)?;
    let addr = spawn_echo_server().await?;
    let stream = connect(addr).await?;
    let fd = bus.register_socket(plain(), stream, None, None).await?;

    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(2);
    let (tx, rx) = tokio::sync::oneshot::channel();
    let seq_id = 42u64;
    bus.send_request(
        fd,
        seq_id,
        encode(seq_id, b"hello bus"),
        deadline,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        None,
    )
    .await?;

    let result = rx.await.expect("completion delivered");
    assert!(result.status.is_ok());
    let unpacked = result.message.expect("Ok completion carries a message");
    assert_eq!(unpacked.seq_id, seq_id);
    let frame = unpacked
        .message
        .downcast_ref::<Frame>()
        .expect("default codec produced a Frame");
    assert_eq!(&frame.value[..], b"hello bus");

    bus.free().await;
    Ok(())
}
