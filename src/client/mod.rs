// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A thin session layer above the bus: an external collaborator that owns
//! HMAC derivation, connection IDs, and maps high-level calls onto
//! [`crate::bus::Bus::send_request`]. [`Session`] is that interface;
//! [`SessionPool`] is a minimal default implementation round-robining
//! requests across a fixed set of already-registered connections.

pub mod session;

pub use session::{ResponseDecoder, Session, SessionPool};
