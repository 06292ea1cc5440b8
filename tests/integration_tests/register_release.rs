// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::os::fd::AsRawFd;

use anyhow::Result;
use kbp_client_rs::error::BusError;
use serial_test::serial;

use crate::integration_tests::common::{connect, plain, spawn_echo_server, test_bus};

#[tokio::test]
#[serial]
async fn register_then_release_plain_socket() -> Result<()> {
    let bus = test_bus(1_000)?;
    let addr = spawn_echo_server().await?;
    let stream = connect(addr).await?;
    let raw_fd = stream.as_raw_fd();

    let fd = bus.register_socket(plain(), stream, None, None).await?;
    assert_eq!(fd, raw_fd);

    let released = bus.release_socket(fd).await?;
    assert!(released.is_none());

    // Releasing an already-released fd now reports it as unregistered.
    let err = bus.release_socket(fd).await.unwrap_err();
    assert!(matches!(err, BusError::UnregisteredSocket(f) if f == fd));

    bus.free().await;
    Ok(())
}
