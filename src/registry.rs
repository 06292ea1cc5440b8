// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The socket registry: a generic open-addressed hash table keyed by raw
//! file descriptor, plus the `ConnectionInfo` record it stores for every
//! socket the bus currently owns.
//!
//! This is deliberately hand-rolled rather than built on `DashMap` (which
//! the rest of this crate's session layer reaches for): the table is a
//! first-class, independently testable component with its own
//! probing/growth contract, and every access to it is already serialized
//! by the bus's coarse registry lock, so no internal synchronization is
//! needed or wanted here.

use std::os::fd::RawFd;

use tokio::io::WriteHalf;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::time::Instant;

use crate::tls::Transport;

/// Open-addressed hash table with linear probing, keyed by `i32`.
///
/// Tombstones mark removed slots so probing past them still finds later
/// entries. The table doubles (and rehashes) once the load factor
/// (including tombstones) would exceed 0.7; it never shrinks.
pub struct FdTable<V> {
    slots: Vec<Slot<V>>,
    len: usize,
    tombstones: usize,
}

enum Slot<V> {
    Empty,
    Occupied(RawFd, V),
    Tombstone,
}

const INITIAL_CAPACITY: usize = 16;
const MAX_LOAD_FACTOR: f64 = 0.7;

impl<V> FdTable<V> {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.next_power_of_two().max(INITIAL_CAPACITY);
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, || Slot::Empty);
        FdTable {
            slots,
            len: 0,
            tombstones: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn index_for(&self, key: RawFd) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::hash::Hash::hash(&key, &mut hasher);
        (std::hash::Hasher::finish(&hasher) as usize) & (self.slots.len() - 1)
    }

    /// Inserts `value` under `key`, returning the previous value if the
    /// key was already present. Grows the table first if needed.
    pub fn set(&mut self, key: RawFd, value: V) -> (bool, Option<V>) {
        if (self.len + self.tombstones + 1) as f64
            > self.slots.len() as f64 * MAX_LOAD_FACTOR
        {
            self.grow();
        }

        let mut idx = self.index_for(key);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.slots[idx] {
                Slot::Empty => {
                    let slot = first_tombstone.unwrap_or(idx);
                    self.slots[slot] = Slot::Occupied(key, value);
                    self.len += 1;
                    if first_tombstone.is_some() {
                        self.tombstones -= 1;
                    }
                    return (true, None);
                },
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                },
                Slot::Occupied(k, _) if *k == key => {
                    let old = std::mem::replace(&mut self.slots[idx], Slot::Empty);
                    let Slot::Occupied(_, old_val) = old else {
                        unreachable!()
                    };
                    self.slots[idx] = Slot::Occupied(key, value);
                    return (true, Some(old_val));
                },
                Slot::Occupied(..) => {},
            }
            idx = (idx + 1) & (self.slots.len() - 1);
        }
    }

    pub fn get(&self, key: RawFd) -> (bool, Option<&V>) {
        let mut idx = self.index_for(key);
        let start = idx;
        loop {
            match &self.slots[idx] {
                Slot::Empty => return (false, None),
                Slot::Occupied(k, v) if *k == key => return (true, Some(v)),
                _ => {},
            }
            idx = (idx + 1) & (self.slots.len() - 1);
            if idx == start {
                return (false, None);
            }
        }
    }

    pub fn remove(&mut self, key: RawFd) -> (bool, Option<V>) {
        let mut idx = self.index_for(key);
        let start = idx;
        loop {
            match &self.slots[idx] {
                Slot::Empty => return (false, None),
                Slot::Occupied(k, _) if *k == key => {
                    let old = std::mem::replace(&mut self.slots[idx], Slot::Tombstone);
                    let Slot::Occupied(_, old_val) = old else {
                        unreachable!()
                    };
                    self.len -= 1;
                    self.tombstones += 1;
                    return (true, Some(old_val));
                },
                _ => {},
            }
            idx = (idx + 1) & (self.slots.len() - 1);
            if idx == start {
                return (false, None);
            }
        }
    }

    /// Drains every live entry, invoking `callback(value)` once per entry.
    pub fn free(&mut self, mut callback: impl FnMut(V)) {
        for slot in self.slots.iter_mut() {
            if let Slot::Occupied(_, v) = std::mem::replace(slot, Slot::Empty) {
                callback(v);
            }
        }
        self.len = 0;
        self.tombstones = 0;
    }

    fn grow(&mut self) {
        let new_cap = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, {
            let mut v = Vec::with_capacity(new_cap);
            v.resize_with(new_cap, || Slot::Empty);
            v
        });
        self.len = 0;
        self.tombstones = 0;
        for slot in old {
            if let Slot::Occupied(k, v) = slot {
                self.set(k, v);
            }
        }
    }
}

impl<V> Default for FdTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-socket state shared between the registry entry and the owning
/// listener's read-pump task.
///
/// The write half lives here (guarded by a mutex, used by the sender for
/// fairness between concurrent `send_request` calls on the same fd); the
/// read half is moved into the read-pump task at registration time and is
/// not reachable from here — only the owning listener ever touches the
/// read side.
pub struct ConnectionInfo {
    pub fd: RawFd,
    pub writer: AsyncMutex<WriteHalf<Transport>>,
    pub largest_wr_seq_id_seen: std::sync::atomic::AtomicU64,
    pub udata: std::sync::Mutex<Option<crate::bus::UserData>>,
    pub listener_index: usize,
}

impl ConnectionInfo {
    pub fn new(
        fd: RawFd,
        writer: WriteHalf<Transport>,
        udata: Option<crate::bus::UserData>,
        listener_index: usize,
    ) -> Self {
        ConnectionInfo {
            fd,
            writer: AsyncMutex::new(writer),
            largest_wr_seq_id_seen: std::sync::atomic::AtomicU64::new(0),
            udata: std::sync::Mutex::new(udata),
            listener_index,
        }
    }
}

/// One-shot channel used by a control-path operation (register/release/
/// shutdown) to learn its outcome from the owning listener.
pub type CompletionTx = oneshot::Sender<bool>;
pub type CompletionRx = oneshot::Receiver<bool>;

/// Absolute point in time a request must be answered by.
pub type Deadline = Instant;
