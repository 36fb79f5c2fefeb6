//! Library defaults for `EngineConfig`.

/// Idle I/O operations kept for reuse.
pub const IO_POOL_CAPACITY: usize = 1000;
/// Idle connection records kept for reuse.
pub const CONN_POOL_CAPACITY: usize = 2 * IO_POOL_CAPACITY;
/// Worker threads per logical CPU.
pub const WORKERS_PER_CORE: usize = 2;
/// Upper bound on worker threads regardless of core count.
pub const MAX_WORKERS: usize = 256;
/// How long a worker blocks on the queue before checking stop / probing.
pub const WAIT_TIMEOUT_MS: u64 = 500;
/// How long `stop()` waits for workers before detaching them.
pub const JOIN_TIMEOUT_MS: u64 = 2_000;
/// How long teardown waits for the kernel to hand back in-flight ops.
pub const DRAIN_GRACE_MS: u64 = 500;
pub const RING_ENTRIES: u32 = 1024;
pub const LISTEN_BACKLOG: i32 = libc::SOMAXCONN;
