// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use kbp_client_rs::{
    bus::{Bus, BusInit},
    cfg::{config::BusConfig, enums::SocketKind},
    codec::framing::{FramingSink, FramingUnpack},
};
use tokio::net::{TcpListener, TcpStream};

/// Builds a bus running the default wire-format codec with a single
/// listener — enough for the single-fd scenarios these tests drive,
/// which don't need fd-to-listener fan-out.
pub fn test_bus(sender_timeout_ms: u64) -> Result<Arc<Bus>> {
    let init = BusInit {
        config: BusConfig {
            listener_count: 1,
            sender_timeout_ms,
            threadpool_max_threads: 2,
            threadpool_max_delay_ms: 50,
            ..Default::default()
        },
        sink: Arc::new(FramingSink),
        unpack: Arc::new(FramingUnpack),
        tls: None,
        unexpected_msg_cb: None,
        error_cb: None,
    };
    Bus::init(init).context("bus init")
}

/// Spawns a loopback server that accepts one connection and echoes back
/// every 9-byte-header-prefixed frame it reads, byte for byte — enough to
/// round-trip a request through `FramingUnpack`'s `seq_id` convention.
pub async fn spawn_echo_server() -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((mut sock, _)) = listener.accept().await else {
            return;
        };
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let Ok(n) = sock.read(&mut buf).await else {
                return;
            };
            if n == 0 {
                return;
            }
            if sock.write_all(&buf[..n]).await.is_err() {
                return;
            }
        }
    });
    Ok(addr)
}

/// Spawns a loopback server that accepts one connection and never writes
/// anything back — for timeout/shutdown scenarios where a response must
/// never arrive.
pub async fn spawn_silent_server() -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((sock, _)) = listener.accept().await else {
            return;
        };
        // Hold the connection open without reading or writing so the
        // client's write (and any response it awaits) never completes
        // from this side.
        std::future::pending::<()>().await;
        drop(sock);
    });
    Ok(addr)
}

pub async fn connect(addr: std::net::SocketAddr) -> Result<TcpStream> {
    Ok(TcpStream::connect(addr).await?)
}

pub fn plain() -> SocketKind {
    SocketKind::Plain
}
