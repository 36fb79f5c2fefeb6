//! # cqnet-core: shared types for the cqnet socket engine
//!
//! Everything the backends and the engine agree on lives here:
//!
//! | Module       | Contents                                             |
//! |--------------|------------------------------------------------------|
//! | `id`         | `ConnId` (descriptor + generation)                   |
//! | `op`         | `IoOperation`, `OpKind`, `IO_BUFFER_SIZE`            |
//! | `completion` | `CompletionQueue` trait, `Completion`, `WaitOutcome` |
//! | `handler`    | `StreamHandler`, `DatagramHandler`, closure adapter  |
//! | `addr`       | IPv4 parsing and `sockaddr_in` conversion            |
//! | `error`      | `NetError`, `Result`                                 |
//! | `kprint`     | leveled stderr logging macros                        |
//! | `env`        | environment variable parsing                         |
//!
//! No I/O happens in this crate; `cqnet-module` implements the queues and
//! pools, `cqnet-engine` the workers and front-ends.

pub mod kprint;
pub mod env;
pub mod error;
pub mod id;
pub mod addr;
pub mod op;
pub mod completion;
pub mod handler;

pub use completion::{Completion, CompletionQueue, PostError, WaitOutcome};
pub use error::{NetError, Result};
pub use handler::{DatagramHandler, StreamCallbacks, StreamHandler};
pub use id::ConnId;
pub use op::{IoOperation, OpKind, IO_BUFFER_SIZE};
