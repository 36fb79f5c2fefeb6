//! # cqnet-module: completion queues, pools and sockets
//!
//! | Piece            | Implementation                               |
//! |------------------|----------------------------------------------|
//! | CompletionQueue  | `UringQueue` (io_uring), `EpollQueue` (epoll) |
//! | Backend choice   | `backend::open_queue` (auto-fallback)         |
//! | Operation pool   | `IoBufferPool` (bounded `ArrayQueue`)         |
//! | Connection pool  | `ConnectionPool` (idle list + active map)     |
//! | Sockets          | `sys` (libc socket/bind/listen/connect)       |
//! | Epoll wakeups    | `EventFdWaker`                                |
//!
//! Linux only: both queue backends are Linux kernel interfaces.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod sys;
        pub mod waker;
        pub mod io_pool;
        pub mod conn_pool;
        pub mod uring_queue;
        pub mod epoll_queue;
        pub mod backend;

        pub use backend::{open_queue, Backend};
        pub use conn_pool::{ConnRole, Connection, ConnectionPool};
        pub use epoll_queue::EpollQueue;
        pub use io_pool::IoBufferPool;
        pub use uring_queue::{UringQueue, UringQueueConfig};
    } else {
        compile_error!("cqnet-module supports Linux only (io_uring / epoll)");
    }
}
