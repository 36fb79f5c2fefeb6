//! Completion queue abstraction.
//!
//! A completion queue receives posted [`IoOperation`]s, lets the kernel
//! (or a readiness emulation) run them, and hands each one back exactly
//! once through [`CompletionQueue::wait`]. Worker threads block in `wait`
//! concurrently; every completion goes to exactly one of them.

use crate::error::NetError;
use crate::id::ConnId;
use crate::op::IoOperation;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// A finished operation.
#[derive(Debug)]
pub struct Completion {
    /// Connection the operation was posted for.
    pub conn: ConnId,
    /// Bytes transferred or accepted descriptor; negated errno on failure.
    pub result: i32,
    /// The operation itself, back in the caller's ownership.
    pub op: Box<IoOperation>,
}

impl Completion {
    pub fn new(op: Box<IoOperation>, result: i32) -> Self {
        Self { conn: op.conn(), result, op }
    }

    /// errno if the operation failed.
    #[inline]
    pub fn errno(&self) -> Option<i32> {
        (self.result < 0).then_some(-self.result)
    }

    /// Non-negative result as a byte count.
    #[inline]
    pub fn bytes(&self) -> Option<usize> {
        (self.result >= 0).then_some(self.result as usize)
    }
}

#[derive(Debug)]
pub enum WaitOutcome {
    Completed(Completion),
    /// Nothing finished within the timeout (or the wait was interrupted).
    Timeout,
    /// The queue itself is broken; the caller should stop waiting on it.
    Failed(NetError),
}

/// A rejected post. The operation is handed back untouched.
#[derive(Debug)]
pub struct PostError {
    pub error: NetError,
    pub op: Box<IoOperation>,
}

pub trait CompletionQueue: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Associate a socket with this queue. Called once per socket, before
    /// the first `post`.
    fn bind(&self, fd: RawFd, conn: ConnId) -> Result<(), NetError>;

    /// Start `op` on `fd`. On success the queue owns `op` until it comes
    /// back from `wait` or `drain`.
    fn post(&self, fd: RawFd, op: Box<IoOperation>) -> Result<(), PostError>;

    /// Block up to `timeout` for the next finished operation.
    fn wait(&self, timeout: Duration) -> WaitOutcome;

    /// Detach a socket that is about to be closed. Returns any operation
    /// the queue was holding for it that the kernel will never complete.
    fn unbind(&self, fd: RawFd) -> Vec<Box<IoOperation>>;

    /// Reclaim every operation still inside the queue, waiting at most
    /// `grace` for in-flight kernel work to report back. Call only after
    /// all workers have stopped and all sockets are closed.
    fn drain(&self, grace: Duration) -> Vec<Box<IoOperation>>;

    /// Operations posted and not yet handed back.
    fn in_flight(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_result_split() {
        let mut op = IoOperation::new();
        op.prepare_receive(ConnId::new(8, 1), false);

        let ok = Completion::new(op, 12);
        assert_eq!(ok.conn, ConnId::new(8, 1));
        assert_eq!(ok.bytes(), Some(12));
        assert_eq!(ok.errno(), None);

        let err = Completion::new(ok.op, -libc::ECONNRESET);
        assert_eq!(err.errno(), Some(libc::ECONNRESET));
        assert_eq!(err.bytes(), None);
    }
}
