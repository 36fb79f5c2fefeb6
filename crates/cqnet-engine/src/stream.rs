//! Stream worker loop.
//!
//! Every worker blocks on the shared completion queue and handles whatever
//! finished: accepts on the listener, receives and sends on streams.
//!
//! ```text
//!   wait ──► Completed ──► lookup(conn) ──miss──► release op
//!    │                        │
//!    │                        ├─ Accept  → adopt, Connected, first Receive, re-post Accept
//!    │                        ├─ Receive → Received, re-post Receive
//!    │                        └─ Send    → continue short write / post next queued send
//!    └──► Timeout ──► probe last-served connection
//! ```

use crate::engine::Shared;

use cqnet_core::completion::{Completion, PostError, WaitOutcome};
use cqnet_core::handler::StreamHandler;
use cqnet_core::id::ConnId;
use cqnet_core::op::{IoOperation, OpKind};
use cqnet_core::{kdebug, kerror, ktrace, kwarn};
use cqnet_module::{sys, ConnRole, Connection};

use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Pause before re-posting an accept that failed for lack of descriptors
/// or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Remote address of an accepted socket. Both backends fill the accept
/// operation's address slot; the socket is asked only if that is empty.
fn accepted_peer(op: &IoOperation, fd: RawFd) -> Option<SocketAddrV4> {
    op.peer().or_else(|| sys::peer_addr(fd).ok())
}

pub(crate) struct StreamWorker {
    index: usize,
    shared: Arc<Shared>,
    handler: Arc<dyn StreamHandler>,
    /// Non-listener connection served most recently; probed on timeout.
    last: Option<ConnId>,
}

impl StreamWorker {
    pub fn new(index: usize, shared: Arc<Shared>, handler: Arc<dyn StreamHandler>) -> Self {
        Self { index, shared, handler, last: None }
    }

    pub fn run(mut self, stop: &AtomicBool) {
        ktrace!("stream worker {} running", self.index);
        let timeout = self.shared.config.wait_timeout;
        while !stop.load(Ordering::Acquire) {
            match self.shared.queue.wait(timeout) {
                WaitOutcome::Completed(c) => self.dispatch(c),
                WaitOutcome::Timeout => self.probe_last(),
                WaitOutcome::Failed(e) => {
                    kerror!("stream worker {}: completion queue failed: {}", self.index, e);
                    break;
                }
            }
        }
        ktrace!("stream worker {} exiting", self.index);
    }

    fn dispatch(&mut self, c: Completion) {
        let Completion { conn: id, result, op } = c;
        let conn = match self.shared.conns.lookup(id) {
            Some(conn) => conn,
            None => {
                ktrace!("completion for vanished conn {} ({:?})", id, op.kind());
                self.shared.io.release(op);
                return;
            }
        };
        match op.kind() {
            OpKind::Accept => self.on_accept(&conn, result, op),
            OpKind::Receive => self.on_receive(conn, id, result, op),
            OpKind::Send => self.on_send(conn, id, result, op),
            OpKind::Idle => {
                kwarn!("idle operation completed on {}", id);
                self.shared.io.release(op);
            }
        }
    }

    fn on_accept(&mut self, listener: &Connection, result: i32, op: Box<IoOperation>) {
        listener.complete_tracked(op.token());
        if result < 0 {
            let errno = -result;
            kwarn!("accept on {} failed: errno {}", listener.id(), errno);
            if matches!(errno, libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) {
                thread::sleep(ACCEPT_BACKOFF);
            }
        } else {
            // SAFETY: a successful accept hands us a fresh descriptor that
            // nothing else owns.
            let fd = unsafe { OwnedFd::from_raw_fd(result) };
            let peer = accepted_peer(&op, fd.as_raw_fd());
            self.adopt(fd, peer);
        }
        self.repost_accept(listener, op);
    }

    /// Keep exactly one accept outstanding by re-posting the same operation.
    fn repost_accept(&self, listener: &Connection, mut op: Box<IoOperation>) {
        op.prepare_accept(listener.id());
        if let Err(PostError { error, op }) = listener.post_accept(self.shared.queue.as_ref(), op) {
            self.shared.io.release(op);
            if self.shared.is_running() {
                kerror!("listener {}: accept re-post failed: {}", listener.id(), error);
            }
        }
    }

    /// Turn an accepted socket into an active connection.
    fn adopt(&mut self, fd: OwnedFd, peer: Option<SocketAddrV4>) {
        let raw = fd.as_raw_fd();
        let local = sys::local_addr(raw).ok();
        if let Err(e) = sys::set_nodelay(raw) {
            ktrace!("TCP_NODELAY on fd {}: {}", raw, e);
        }

        let conns = &self.shared.conns;
        let conn = conns.open(fd, ConnRole::Stream, local, peer);
        let id = conn.id();
        if !conns.activate(conn.clone()) {
            conns.release(conn);
            return;
        }
        if let Err(e) = self.shared.queue.bind(raw, id) {
            kwarn!("conn {}: queue bind failed: {}", id, e);
            drop(conn);
            conns.deactivate(id);
            return;
        }

        kdebug!("conn {} accepted from {:?}", id, peer);
        self.handler.on_connected(id);

        if let Err(e) = conn.post_receive(self.shared.queue.as_ref()) {
            kdebug!("conn {}: first receive failed: {}", id, e);
            drop(conn);
            self.disconnect(id);
        }
    }

    fn on_receive(
        &mut self,
        conn: Arc<Connection>,
        id: ConnId,
        result: i32,
        mut op: Box<IoOperation>,
    ) {
        if result <= 0 {
            if result < 0 {
                self.log_failure(id, "receive", -result);
            } else {
                ktrace!("conn {} closed by peer", id);
            }
            self.shared.io.release(op);
            drop(conn);
            self.disconnect(id);
            return;
        }

        self.last = Some(id);
        let data = op.complete_receive(result as usize);
        self.handler.on_received(id, data);

        if let Some(op) = conn.park_receive(op) {
            // Closed (or recycled) while the callback ran.
            self.shared.io.release(op);
            return;
        }
        if let Err(e) = conn.post_receive(self.shared.queue.as_ref()) {
            kdebug!("conn {}: receive re-post failed: {}", id, e);
            drop(conn);
            self.disconnect(id);
        }
    }

    fn on_send(
        &mut self,
        conn: Arc<Connection>,
        id: ConnId,
        result: i32,
        mut op: Box<IoOperation>,
    ) {
        let queue = self.shared.queue.as_ref();
        if result < 0 || (result == 0 && !op.unsent().is_empty()) {
            if result < 0 {
                self.log_failure(id, "send", -result);
            }
            self.shared.io.release(op);
            drop(conn);
            self.disconnect(id);
            return;
        }

        self.last = Some(id);
        if !op.advance_send(result as usize) {
            ktrace!("conn {}: short send, {} bytes left", id, op.unsent().len());
            if let Err(PostError { error, op }) = conn.resume_send(queue, op) {
                kdebug!("conn {}: send continuation failed: {}", id, error);
                self.shared.io.release(op);
                drop(conn);
                self.disconnect(id);
            }
            return;
        }

        // Token must leave the pending set before the op can be reused.
        let next = conn.finish_send(queue, op.token());
        self.shared.io.release(op);
        if let Err(PostError { error, op }) = next {
            kdebug!("conn {}: queued send failed: {}", id, error);
            self.shared.io.release(op);
            drop(conn);
            self.disconnect(id);
        }
    }

    fn probe_last(&mut self) {
        let Some(id) = self.last.take() else { return };
        let Some(conn) = self.shared.conns.lookup(id) else { return };
        match conn.probe() {
            Ok(()) => self.last = Some(id),
            Err(errno) => {
                kdebug!("conn {} failed liveness probe: errno {}", id, errno);
                drop(conn);
                self.disconnect(id);
            }
        }
    }

    fn log_failure(&self, id: ConnId, what: &str, errno: i32) {
        if sys::is_disconnect(errno) {
            kdebug!("conn {} {} failed: errno {}", id, what, errno);
        } else {
            kwarn!("conn {} {} failed: errno {}", id, what, errno);
        }
    }

    /// Deactivate `id`; the call that wins the removal reports it.
    fn disconnect(&mut self, id: ConnId) {
        if self.last == Some(id) {
            self.last = None;
        }
        if self.shared.conns.deactivate(id) {
            kdebug!("conn {} disconnected", id);
            self.handler.on_disconnected(id);
        }
    }
}
