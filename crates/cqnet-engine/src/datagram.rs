//! Datagram worker loop.
//!
//! Same wait loop as the stream worker without accepts or probing. A
//! failed receive is not a disconnect for a datagram socket: the receive
//! is re-posted and the socket keeps going.

use crate::engine::Shared;

use cqnet_core::completion::{Completion, PostError, WaitOutcome};
use cqnet_core::handler::DatagramHandler;
use cqnet_core::id::ConnId;
use cqnet_core::op::{IoOperation, OpKind};
use cqnet_core::{kdebug, kerror, ktrace, kwarn};
use cqnet_module::Connection;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct DatagramWorker {
    index: usize,
    shared: Arc<Shared>,
    handler: Arc<dyn DatagramHandler>,
}

impl DatagramWorker {
    pub fn new(index: usize, shared: Arc<Shared>, handler: Arc<dyn DatagramHandler>) -> Self {
        Self { index, shared, handler }
    }

    pub fn run(self, stop: &AtomicBool) {
        ktrace!("datagram worker {} running", self.index);
        let timeout = self.shared.config.wait_timeout;
        while !stop.load(Ordering::Acquire) {
            match self.shared.queue.wait(timeout) {
                WaitOutcome::Completed(c) => self.dispatch(c),
                WaitOutcome::Timeout => {}
                WaitOutcome::Failed(e) => {
                    kerror!("datagram worker {}: completion queue failed: {}", self.index, e);
                    break;
                }
            }
        }
        ktrace!("datagram worker {} exiting", self.index);
    }

    fn dispatch(&self, c: Completion) {
        let Completion { conn: id, result, op } = c;
        let conn = match self.shared.conns.lookup(id) {
            Some(conn) => conn,
            None => {
                ktrace!("completion for vanished socket {} ({:?})", id, op.kind());
                self.shared.io.release(op);
                return;
            }
        };
        match op.kind() {
            OpKind::Receive => self.on_receive(conn, id, result, op),
            OpKind::Send => self.on_send(&conn, id, result, op),
            kind => {
                kwarn!("unexpected {:?} completion on datagram socket {}", kind, id);
                self.shared.io.release(op);
            }
        }
    }

    fn on_receive(&self, conn: Arc<Connection>, id: ConnId, result: i32, mut op: Box<IoOperation>) {
        if result < 0 {
            kdebug!("datagram {} receive failed: errno {}", id, -result);
        } else {
            let from = op
                .peer()
                .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
            if op.is_truncated() {
                kdebug!("datagram {}: message from {} truncated to {} bytes", id, from, result);
            }
            let data = op.complete_receive(result as usize);
            self.handler.on_received_from(id, data, from);
        }

        if let Some(op) = conn.park_receive(op) {
            self.shared.io.release(op);
            return;
        }
        if let Err(e) = conn.post_receive(self.shared.queue.as_ref()) {
            kwarn!("datagram {}: receive re-post failed, closing: {}", id, e);
            drop(conn);
            self.shared.conns.deactivate(id);
        }
    }

    fn on_send(&self, conn: &Connection, id: ConnId, result: i32, op: Box<IoOperation>) {
        if result < 0 {
            kdebug!("datagram {} send failed: errno {}", id, -result);
        }
        let next = conn.finish_send(self.shared.queue.as_ref(), op.token());
        self.shared.io.release(op);
        if let Err(PostError { error, op }) = next {
            kdebug!("datagram {}: queued send failed: {}", id, error);
            self.shared.io.release(op);
        }
    }
}
