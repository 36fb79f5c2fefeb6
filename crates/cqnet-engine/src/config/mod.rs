//! Engine configuration
//!
//! Library defaults with runtime environment overrides, adjustable
//! through builder methods.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env`)
//! 3. Library defaults (`defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use cqnet_engine::EngineConfig;
//! use cqnet_module::Backend;
//!
//! let config = EngineConfig::from_env()
//!     .num_workers(4)
//!     .backend(Backend::Epoll);
//! ```

pub mod defaults;

use cqnet_core::env::{env_get, env_get_millis, env_get_opt};
use cqnet_core::error::{NetError, Result};
use cqnet_module::Backend;

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// High-water mark of the I/O operation pool
    pub io_pool_capacity: usize,
    /// High-water mark of the connection pool
    pub conn_pool_capacity: usize,
    /// Workers per logical CPU when `num_workers` is unset
    pub workers_per_core: usize,
    /// Fixed worker count, overriding `workers_per_core`
    pub num_workers: Option<usize>,
    pub wait_timeout: Duration,
    pub join_timeout: Duration,
    pub drain_grace: Duration,
    pub ring_entries: u32,
    pub listen_backlog: i32,
    pub backend: Backend,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl EngineConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `CQN_IO_POOL_CAPACITY` - idle I/O operations kept
    /// - `CQN_CONN_POOL_CAPACITY` - idle connections kept
    /// - `CQN_WORKERS_PER_CORE` - workers per logical CPU
    /// - `CQN_NUM_WORKERS` - fixed worker count
    /// - `CQN_WAIT_TIMEOUT_MS` - queue wait timeout
    /// - `CQN_JOIN_TIMEOUT_MS` - bounded join on stop
    /// - `CQN_DRAIN_GRACE_MS` - teardown drain wait
    /// - `CQN_RING_ENTRIES` - io_uring submission entries
    /// - `CQN_LISTEN_BACKLOG` - listen(2) backlog
    /// - `CQN_BACKEND` - auto / uring / epoll
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            io_pool_capacity: env_get("CQN_IO_POOL_CAPACITY", base.io_pool_capacity),
            conn_pool_capacity: env_get("CQN_CONN_POOL_CAPACITY", base.conn_pool_capacity),
            workers_per_core: env_get("CQN_WORKERS_PER_CORE", base.workers_per_core),
            num_workers: env_get_opt("CQN_NUM_WORKERS"),
            wait_timeout: env_get_millis("CQN_WAIT_TIMEOUT_MS", base.wait_timeout),
            join_timeout: env_get_millis("CQN_JOIN_TIMEOUT_MS", base.join_timeout),
            drain_grace: env_get_millis("CQN_DRAIN_GRACE_MS", base.drain_grace),
            ring_entries: env_get("CQN_RING_ENTRIES", base.ring_entries),
            listen_backlog: env_get("CQN_LISTEN_BACKLOG", base.listen_backlog),
            backend: env_get("CQN_BACKEND", base.backend),
        }
    }

    /// Library defaults only, ignoring the environment.
    pub fn new() -> Self {
        Self {
            io_pool_capacity: defaults::IO_POOL_CAPACITY,
            conn_pool_capacity: defaults::CONN_POOL_CAPACITY,
            workers_per_core: defaults::WORKERS_PER_CORE,
            num_workers: None,
            wait_timeout: Duration::from_millis(defaults::WAIT_TIMEOUT_MS),
            join_timeout: Duration::from_millis(defaults::JOIN_TIMEOUT_MS),
            drain_grace: Duration::from_millis(defaults::DRAIN_GRACE_MS),
            ring_entries: defaults::RING_ENTRIES,
            listen_backlog: defaults::LISTEN_BACKLOG,
            backend: Backend::Auto,
        }
    }

    // Builder methods

    pub fn io_pool_capacity(mut self, n: usize) -> Self {
        self.io_pool_capacity = n;
        self
    }

    pub fn conn_pool_capacity(mut self, n: usize) -> Self {
        self.conn_pool_capacity = n;
        self
    }

    pub fn workers_per_core(mut self, n: usize) -> Self {
        self.workers_per_core = n;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = Some(n);
        self
    }

    pub fn wait_timeout(mut self, d: Duration) -> Self {
        self.wait_timeout = d;
        self
    }

    pub fn join_timeout(mut self, d: Duration) -> Self {
        self.join_timeout = d;
        self
    }

    pub fn drain_grace(mut self, d: Duration) -> Self {
        self.drain_grace = d;
        self
    }

    pub fn ring_entries(mut self, n: u32) -> Self {
        self.ring_entries = n;
        self
    }

    pub fn listen_backlog(mut self, n: i32) -> Self {
        self.listen_backlog = n;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Worker threads to spawn: `num_workers`, or `workers_per_core` times
    /// the logical CPU count.
    pub fn worker_count(&self) -> usize {
        let n = match self.num_workers {
            Some(n) => n,
            None => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                cpus * self.workers_per_core
            }
        };
        n.clamp(1, defaults::MAX_WORKERS)
    }

    pub fn validate(&self) -> Result<()> {
        if self.io_pool_capacity == 0 {
            return Err(NetError::InvalidConfig("io_pool_capacity must be > 0"));
        }
        if self.conn_pool_capacity == 0 {
            return Err(NetError::InvalidConfig("conn_pool_capacity must be > 0"));
        }
        let per_core_zero = self.num_workers.is_none() && self.workers_per_core == 0;
        if self.num_workers == Some(0) || per_core_zero {
            return Err(NetError::InvalidConfig("worker count must be > 0"));
        }
        if self.wait_timeout.is_zero() {
            return Err(NetError::InvalidConfig("wait_timeout must be > 0"));
        }
        if self.ring_entries == 0 {
            return Err(NetError::InvalidConfig("ring_entries must be > 0"));
        }
        if self.listen_backlog <= 0 {
            return Err(NetError::InvalidConfig("listen_backlog must be > 0"));
        }
        Ok(())
    }
}
