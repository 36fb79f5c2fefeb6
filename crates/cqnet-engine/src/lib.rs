//! # cqnet-engine: worker threads and socket front-ends
//!
//! ```text
//!  StreamServer / StreamClient / DatagramNode        (front-ends)
//!        │ send / connect / create / close_socket
//!        ▼
//!  Engine ── Shared { config, CompletionQueue, IoBufferPool, ConnectionPool }
//!        │                     ▲
//!        │ start               │ wait() → Completion
//!        ▼                     │
//!  WorkerPool ── StreamWorker / DatagramWorker ──► StreamHandler / DatagramHandler
//! ```
//!
//! | Front-end       | Sockets                         | Callbacks                       |
//! |-----------------|---------------------------------|---------------------------------|
//! | `StreamServer`  | one listener + accepted streams | connected, received, disconnected |
//! | `StreamClient`  | outgoing streams                | received, disconnected          |
//! | `DatagramNode`  | bound UDP sockets               | received_from                   |
//!
//! Lifecycle: `init` → `start` → (`stop`) → `deinit`. `stop` is idempotent;
//! `deinit` (or dropping the front-end) stops if needed and reclaims every
//! in-flight operation.

pub mod config;
mod datagram;
mod engine;
mod handle;
mod stream;
mod worker;

mod client;
mod node;
mod server;

pub use client::StreamClient;
pub use config::EngineConfig;
pub use handle::{DatagramHandle, StreamHandle};
pub use node::DatagramNode;
pub use server::StreamServer;

pub use cqnet_core::{
    ConnId, DatagramHandler, NetError, Result, StreamCallbacks, StreamHandler,
};
pub use cqnet_module::Backend;

#[cfg(test)]
mod tests;
