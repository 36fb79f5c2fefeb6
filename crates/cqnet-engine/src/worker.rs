//! Worker thread management
//!
//! Workers are named OS threads that block on the shared completion
//! queue. Stopping is cooperative: the shutdown flag is checked after
//! every wait, so a worker notices it within one wait timeout.

use cqnet_core::error::{NetError, Result};
use cqnet_core::{kdebug, kerror};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often `join_bounded` re-checks unfinished workers.
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Pool of worker threads
pub struct WorkerPool {
    /// Thread name prefix, e.g. "cqnet-stream"
    name: &'static str,

    /// Join handles for worker threads
    handles: Vec<JoinHandle<()>>,

    /// Shutdown flag, shared with every worker
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handles: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn `n` threads running `worker_fn(index, shutdown_flag)`.
    ///
    /// If a spawn fails, the threads already started are signalled and
    /// the error is returned.
    pub fn start<F>(&mut self, n: usize, worker_fn: F) -> Result<()>
    where
        F: Fn(usize, &AtomicBool) + Send + Sync + Clone + 'static,
    {
        for i in 0..n {
            let worker_fn = worker_fn.clone();
            let shutdown = self.shutdown.clone();

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || worker_fn(i, &shutdown));

            match spawned {
                Ok(handle) => self.handles.push(handle),
                Err(e) => {
                    kerror!("failed to spawn {}-{}: {}", self.name, i, e);
                    self.shutdown();
                    return Err(NetError::from(e));
                }
            }
        }
        kdebug!("{} x{} started", self.name, n);
        Ok(())
    }

    /// Signal shutdown to all workers
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Threads started and not yet joined or detached.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    /// Join workers, giving up after `timeout`.
    ///
    /// Threads still running at the deadline are detached and keep
    /// running until their next shutdown check. Returns how many were
    /// detached.
    pub fn join_bounded(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let mut i = 0;
            while i < self.handles.len() {
                if self.handles[i].is_finished() {
                    let handle = self.handles.swap_remove(i);
                    let name = handle.thread().name().unwrap_or("?").to_string();
                    if handle.join().is_err() {
                        kerror!("{} panicked", name);
                    }
                } else {
                    i += 1;
                }
            }
            if self.handles.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(JOIN_POLL);
        }

        let detached = self.handles.len();
        for handle in self.handles.drain(..) {
            kerror!(
                "{} did not exit within {:?}; detaching",
                handle.thread().name().unwrap_or("?"),
                timeout
            );
        }
        detached
    }
}
