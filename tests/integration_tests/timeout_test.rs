// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use kbp_client_rs::error::CompletionStatus;
use serial_test::serial;

use crate::integration_tests::common::{connect, plain, spawn_silent_server, test_bus};

fn encode(seq_id: u64) -> Bytes {
    let mut proto = seq_id.to_be_bytes().to_vec();
    proto.extend_from_slice(b"tag");
    let mut out = Vec::with_capacity(9 + proto.len());
    out.push(0xA0);
    out.extend_from_slice(&(proto.len() as u32).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&proto);
    Bytes::from(out)
}

#[tokio::test]
#[serial]
async fn unanswered_request_times_out_near_its_deadline() -> Result<()> {
    let bus = test_bus(5_000)?;
    let addr = spawn_silent_server().await?;
    let stream = connect(addr).await?;
    let fd = bus.register_socket(plain(), stream, None, None).await?;

    let started = tokio::time::Instant::now();
    let deadline = started + Duration::from_millis(50);
    let (tx, rx) = tokio::sync::oneshot::channel();
    bus.send_request(
        fd,
        1,
        encode(1),
        deadline,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        None,
    )
    .await?;

    let result = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("completion must fire")
        .expect("completion channel not dropped");
    assert_eq!(result.status, CompletionStatus::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(50));

    bus.free().await;
    Ok(())
}
