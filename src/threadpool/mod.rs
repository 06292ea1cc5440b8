// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Fixed-cap worker pool that runs user completion callbacks off the
//! listener tasks.
//!
//! Workers are plain OS threads rather than `tokio::task::spawn_blocking`
//! calls: the pool owns its own lifecycle (lazy spawn, idle-reap,
//! drain-or-abandon shutdown) independently of the tokio runtime and of
//! any particular listener. A worker parks on a `Condvar` when the queue
//! is empty and exits once it wakes to an empty queue after
//! `max_delay_ms`.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    condvar: Condvar,
    shutdown: Mutex<ShutdownMode>,
    live_workers: AtomicUsize,
    max_threads: usize,
    max_delay: Duration,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ShutdownMode {
    Running,
    Draining,
    Abandoning,
}

/// Configuration for a [`ThreadPool`]: a cap on live worker threads and
/// how long an idle one waits on the queue before it exits.
#[derive(Debug, Clone, Copy)]
pub struct ThreadPoolConfig {
    pub max_threads: usize,
    pub max_delay_ms: u64,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        ThreadPoolConfig {
            max_threads: num_cpus(),
            max_delay_ms: 100,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// A pool of lazily-spawned OS threads running submitted jobs.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(config: ThreadPoolConfig) -> Self {
        ThreadPool {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                condvar: Condvar::new(),
                shutdown: Mutex::new(ShutdownMode::Running),
                live_workers: AtomicUsize::new(0),
                max_threads: config.max_threads.max(1),
                max_delay: Duration::from_millis(config.max_delay_ms),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Enqueues `job` and returns the queue depth immediately after the
    /// push as a backpressure signal: non-decreasing as the queue grows,
    /// so callers can pace themselves off it without a separate poll.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> usize {
        let depth = {
            let mut queue = match self.shared.queue.lock() {
                Ok(q) => q,
                Err(poisoned) => poisoned.into_inner(),
            };
            queue.push_back(Box::new(job));
            queue.len()
        };
        self.maybe_spawn_worker();
        self.shared.condvar.notify_one();
        depth
    }

    fn maybe_spawn_worker(&self) {
        let live = self.shared.live_workers.load(Ordering::Acquire);
        if live >= self.shared.max_threads {
            return;
        }
        if self
            .shared
            .live_workers
            .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || worker_loop(shared));
        if let Ok(mut workers) = self.workers.lock() {
            workers.push(handle);
        }
    }

    /// Shuts the pool down. Non-forcing drains whatever is queued before
    /// exiting workers (a spurious wake-up job is pushed per live worker
    /// so a parked worker observes the shutdown flag); forcing drops the
    /// queue immediately.
    pub fn shutdown(&self, force: bool) {
        {
            let mut mode = match self.shared.shutdown.lock() {
                Ok(m) => m,
                Err(p) => p.into_inner(),
            };
            if *mode != ShutdownMode::Running {
                return;
            }
            *mode = if force {
                ShutdownMode::Abandoning
            } else {
                ShutdownMode::Draining
            };
        }

        if force {
            let mut queue = match self.shared.queue.lock() {
                Ok(q) => q,
                Err(p) => p.into_inner(),
            };
            queue.clear();
        }

        let live = self.shared.live_workers.load(Ordering::Acquire);
        {
            let mut queue = match self.shared.queue.lock() {
                Ok(q) => q,
                Err(p) => p.into_inner(),
            };
            for _ in 0..live {
                queue.push_back(Box::new(|| {}));
            }
        }
        self.shared.condvar.notify_all();

        let handles = match self.workers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(mut p) => std::mem::take(&mut *p.get_mut()),
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = match shared.queue.lock() {
                Ok(q) => q,
                Err(p) => p.into_inner(),
            };
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }

                let mode = *match shared.shutdown.lock() {
                    Ok(m) => m,
                    Err(p) => p.into_inner(),
                };
                if mode != ShutdownMode::Running {
                    break None;
                }

                let (guard, timeout) = match shared.condvar.wait_timeout(queue, shared.max_delay)
                {
                    Ok(pair) => pair,
                    Err(p) => p.into_inner(),
                };
                queue = guard;
                if timeout.timed_out() && queue.is_empty() {
                    break None;
                }
            }
        };

        match job {
            Some(job) => job(),
            None => break,
        }
    }
    shared.live_workers.fetch_sub(1, Ordering::AcqRel);
}
