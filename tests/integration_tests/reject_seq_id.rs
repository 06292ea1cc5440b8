// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use kbp_client_rs::error::BusError;
use serial_test::serial;

use crate::integration_tests::common::{connect, plain, spawn_echo_server, test_bus};

fn encode(seq_id: u64, payload: &[u8]) -> Bytes {
    let mut proto = seq_id.to_be_bytes().to_vec();
    proto.extend_from_slice(b"req");
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
async fn equal_seq_id_is_rejected_without_mutating_state() -> Result<()> {
    let bus = test_bus(2_000)?;
    let addr = spawn_echo_server().await?;
    let stream = connect(addr).await?;
    let fd = bus.register_socket(plain(), stream, None, None).await?;

    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(2);
    let (tx, rx) = tokio::sync::oneshot::channel();
    bus.send_request(
        fd,
        3,
        encode(3, b"payload"),
        deadline,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        None,
    )
    .await?;
    let first = rx.await.expect("first completion");
    assert!(first.status.is_ok());

    // A second send_request with the same seq_id must be rejected
    // synchronously and never reach the wire.
    let (tx2, _rx2) = tokio::sync::oneshot::channel();
    let err = bus
        .send_request(
            fd,
            3,
            encode(3, b"payload"),
            deadline,
            Box::new(move |result| {
                let _ = tx2.send(result);
            }),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BusError::SeqIdRejected { fd: f, got: 3, largest: 3 } if f == fd
    ));

    // A lower seq_id is rejected the same way.
    let (tx3, _rx3) = tokio::sync::oneshot::channel();
    let err = bus
        .send_request(
            fd,
            1,
            encode(1, b"x"),
            deadline,
            Box::new(move |result| {
                let _ = tx3.send(result);
            }),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::SeqIdRejected { got: 1, largest: 3, .. }));

    bus.free().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn concurrent_equal_seq_id_sends_never_both_succeed() -> Result<()> {
    let bus = test_bus(2_000)?;
    let addr = spawn_echo_server().await?;
    let stream = connect(addr).await?;
    let fd = bus.register_socket(plain(), stream, None, None).await?;
    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(2);

    let (tx_a, rx_a) = tokio::sync::oneshot::channel();
    let (tx_b, rx_b) = tokio::sync::oneshot::channel();
    let send_a = bus.send_request(
        fd,
        5,
        encode(5, b"a"),
        deadline,
        Box::new(move |result| {
            let _ = tx_a.send(result);
        }),
        None,
    );
    let send_b = bus.send_request(
        fd,
        5,
        encode(5, b"b"),
        deadline,
        Box::new(move |result| {
            let _ = tx_b.send(result);
        }),
        None,
    );
    let (res_a, res_b) = tokio::join!(send_a, send_b);

    // The atomic check-and-commit on `largest_wr_seq_id_seen` admits
    // exactly one of two concurrent sends at the same seq_id, never both.
    assert_ne!(res_a.is_ok(), res_b.is_ok());
    if res_a.is_err() {
        assert!(matches!(res_a.unwrap_err(), BusError::SeqIdRejected { got: 5, .. }));
    }
    if res_b.is_err() {
        assert!(matches!(res_b.unwrap_err(), BusError::SeqIdRejected { got: 5, .. }));
    }
    if let Ok(()) = res_a {
        assert!(rx_a.await.expect("winner completion").status.is_ok());
    } else {
        assert!(rx_b.await.expect("winner completion").status.is_ok());
    }

    bus.free().await;
    Ok(())
}
