// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Transport abstraction used everywhere a socket is registered with the
//! bus: a plain `TcpStream`, or one wrapped in a TLS session. The listener
//! and sender only ever see [`Transport`]; neither knows or cares which
//! variant it is holding.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use rustls_pki_types::ServerName;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{TlsConnector, client::TlsStream};

/// Failures specific to establishing or tearing down a TLS session.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("invalid TLS client configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] std::io::Error),
}

/// The byte stream backing a registered socket. Plain sockets pass bytes
/// through untouched; `Ssl` sockets have already completed a TLS
/// handshake by the time they reach the listener.
pub enum Transport {
    Plain(TcpStream),
    Ssl(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Wraps `tcp` in a client-side TLS session using `connector`,
    /// blocking (within this call) until the handshake completes.
    pub async fn connect_tls(
        connector: &TlsConnector,
        server_name: &str,
        tcp: TcpStream,
    ) -> Result<Self, TlsError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;
        let stream = connector.connect(name, tcp).await?;
        Ok(Transport::Ssl(Box::new(stream)))
    }

    pub fn plain(tcp: TcpStream) -> Self {
        Transport::Plain(tcp)
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Ssl(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Ssl(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Ssl(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Ssl(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One SSL context shared by every `Ssl`-kind socket the bus registers,
/// built once at `Bus::init` time rather than one context per connection.
pub struct TlsAdapter {
    connector: TlsConnector,
}

impl TlsAdapter {
    pub fn new(root_store: rustls::RootCertStore) -> Result<Self, TlsError> {
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Ok(TlsAdapter {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Performs the TLS handshake over an already-connected `tcp` stream,
    /// returning a [`Transport::Ssl`] ready to be registered with the bus.
    pub async fn connect(
        &self,
        server_name: &str,
        tcp: TcpStream,
    ) -> Result<Transport, TlsError> {
        Transport::connect_tls(&self.connector, server_name, tcp).await
    }
}
