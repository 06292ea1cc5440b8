// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Marker types for the device's request/response surface.
//!
//! None of this is wire format: the real message bodies are protobuf
//! messages defined by an external collaborator. What lives here is just
//! enough shape — an operation tag plus a `seq_id`-bearing envelope — for
//! [`crate::bus::Bus::send_request`] and the [`crate::codec`] contract to
//! have something concrete to move across the wire in tests and examples.

pub mod ops;
