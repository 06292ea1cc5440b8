// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::LogLevel;

/// The numeric, serializable half of a bus's configuration. Callbacks
/// (`sink_cb`, `unpack_cb`, the unexpected-message and error hooks) are
/// trait objects supplied programmatically at `Bus::init` time — they are
/// not part of this struct, since they cannot round-trip through YAML.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BusConfig {
    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default = "default_sender_timeout_ms")]
    pub sender_timeout_ms: u64,

    #[serde(default = "default_listener_count")]
    pub listener_count: usize,

    #[serde(default = "default_threadpool_max_threads")]
    pub threadpool_max_threads: usize,

    #[serde(default = "default_threadpool_max_delay_ms")]
    pub threadpool_max_delay_ms: u64,

    #[serde(default = "default_backpressure_shift")]
    pub backpressure_shift: u32,
}

fn default_sender_timeout_ms() -> u64 {
    10_000
}

fn default_listener_count() -> usize {
    8
}

fn default_threadpool_max_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_threadpool_max_delay_ms() -> u64 {
    100
}

fn default_backpressure_shift() -> u32 {
    8
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            log_level: LogLevel::default(),
            sender_timeout_ms: default_sender_timeout_ms(),
            listener_count: default_listener_count(),
            threadpool_max_threads: default_threadpool_max_threads(),
            threadpool_max_delay_ms: default_threadpool_max_delay_ms(),
            backpressure_shift: default_backpressure_shift(),
        }
    }
}

impl BusConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: BusConfig =
            serde_yaml::from_str(&s).context("failed to parse bus config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants that would otherwise surface as a confusing
    /// panic deep inside `Bus::init` (an empty listener pool, a
    /// zero-capacity thread-pool).
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.listener_count >= 1, "listener_count must be >= 1");
        ensure!(
            self.threadpool_max_threads >= 1,
            "threadpool_max_threads must be >= 1"
        );
        Ok(())
    }
}
