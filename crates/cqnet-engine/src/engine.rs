//! Engine core shared by the three front-ends.
//!
//! `Shared` is what workers and handles see: configuration, the completion
//! queue and both pools. `Engine` adds the worker threads and the
//! lifecycle state machine (Initialized → Running → Stopped).

use crate::config::EngineConfig;
use crate::worker::WorkerPool;

use cqnet_core::completion::{CompletionQueue, PostError};
use cqnet_core::error::{NetError, Result};
use cqnet_core::id::ConnId;
use cqnet_core::op::IoOperation;
use cqnet_core::{kdebug, kinfo, kwarn};
use cqnet_module::{open_queue, sys, ConnRole, Connection, ConnectionPool, IoBufferPool};

use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct Shared {
    pub config: EngineConfig,
    pub queue: Arc<dyn CompletionQueue>,
    pub io: Arc<IoBufferPool>,
    pub conns: ConnectionPool,
    running: AtomicBool,
}

impl Shared {
    fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let queue = open_queue(config.backend, config.ring_entries)?;
        let io = Arc::new(IoBufferPool::new(config.io_pool_capacity));
        let conns = ConnectionPool::new(config.conn_pool_capacity, io.clone(), queue.clone());
        Ok(Self {
            config,
            queue,
            io,
            conns,
            running: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn check_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(NetError::NotStarted)
        }
    }

    /// Queue `data` on stream `id`, split into buffer-sized operations.
    pub fn send(&self, id: ConnId, data: &[u8]) -> Result<()> {
        self.check_running()?;
        let conn = self.conns.lookup(id).ok_or(NetError::NotFound(id))?;
        if conn.role() != ConnRole::Stream {
            return Err(NetError::Unsupported("send on a non-stream connection"));
        }
        for chunk in data.chunks(self.io.buffer_size()) {
            let mut op = self.io.acquire();
            op.prepare_send(id, chunk)?;
            self.post_send(&conn, id, op)?;
        }
        Ok(())
    }

    /// Send one datagram from socket `id` to `dest`.
    pub fn send_to(&self, id: ConnId, data: &[u8], dest: SocketAddrV4) -> Result<()> {
        self.check_running()?;
        let conn = self.conns.lookup(id).ok_or(NetError::NotFound(id))?;
        if conn.role() != ConnRole::Datagram {
            return Err(NetError::Unsupported("send_to on a non-datagram socket"));
        }
        let max = self.io.buffer_size();
        if data.len() > max {
            return Err(NetError::PayloadTooLarge { len: data.len(), max });
        }
        let mut op = self.io.acquire();
        op.prepare_send_to(id, data, dest)?;
        self.post_send(&conn, id, op)
    }

    fn post_send(&self, conn: &Connection, id: ConnId, op: Box<IoOperation>) -> Result<()> {
        match conn.post_send(self.queue.as_ref(), op) {
            Ok(()) => Ok(()),
            Err(PostError { error, op }) => {
                self.io.release(op);
                match error {
                    NetError::Closed => Err(NetError::NotFound(id)),
                    other => Err(other),
                }
            }
        }
    }

    /// Close `id` without notifying the handler. Unknown ids are ignored.
    pub fn close(&self, id: ConnId) -> bool {
        let closed = self.conns.deactivate(id);
        if closed {
            kdebug!("conn {} closed by application", id);
        }
        closed
    }

    pub fn local_addr(&self, id: ConnId) -> Result<SocketAddrV4> {
        let conn = self.conns.lookup(id).ok_or(NetError::NotFound(id))?;
        conn.local_addr().ok_or(NetError::NotFound(id))
    }

    /// Register a fresh socket: open, activate and bind it to the queue.
    /// Anything that fails afterwards is undone by deactivating.
    fn register(
        &self,
        fd: OwnedFd,
        role: ConnRole,
        local: Option<SocketAddrV4>,
        peer: Option<SocketAddrV4>,
    ) -> Result<Arc<Connection>> {
        let conn = self.conns.open(fd, role, local, peer);
        let id = conn.id();
        if !self.conns.activate(conn.clone()) {
            self.conns.release(conn);
            return Err(NetError::Unsupported("connection id already active"));
        }
        let bound = match conn.raw_fd() {
            Some(raw) => self.queue.bind(raw, id),
            None => Err(NetError::Closed),
        };
        if let Err(e) = bound {
            drop(conn);
            self.conns.deactivate(id);
            return Err(e);
        }
        Ok(conn)
    }

    /// Register `fd` and post its first receive.
    fn register_receiving(
        &self,
        fd: OwnedFd,
        role: ConnRole,
        local: Option<SocketAddrV4>,
        peer: Option<SocketAddrV4>,
    ) -> Result<ConnId> {
        let conn = self.register(fd, role, local, peer)?;
        let id = conn.id();
        if let Err(e) = conn.post_receive(self.queue.as_ref()) {
            drop(conn);
            self.conns.deactivate(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Create a listening socket and register it. No accept is posted.
    pub fn open_listener(&self, at: SocketAddrV4) -> Result<Arc<Connection>> {
        let fd = sys::tcp_listener(at, self.config.listen_backlog)?;
        let local = sys::local_addr(fd.as_raw_fd())?;
        let conn = self.register(fd, ConnRole::Listener, Some(local), None)?;
        kinfo!("listening on {} as {}", local, conn.id());
        Ok(conn)
    }

    /// Post one accept on `listener`.
    pub fn post_accept(&self, listener: &Connection) -> Result<()> {
        let mut op = self.io.acquire();
        op.prepare_accept(listener.id());
        listener.post_accept(self.queue.as_ref(), op).map_err(|PostError { error, op }| {
            self.io.release(op);
            error
        })
    }

    /// Connect a stream socket to `to` and start receiving on it.
    pub fn open_stream(&self, to: SocketAddrV4) -> Result<ConnId> {
        self.check_running()?;
        let fd = sys::tcp_connect(to)?;
        let local = sys::local_addr(fd.as_raw_fd()).ok();
        let id = self.register_receiving(fd, ConnRole::Stream, local, Some(to))?;
        kdebug!("conn {} connected to {}", id, to);
        Ok(id)
    }

    /// Bind a datagram socket at `at` and start receiving on it. Returns
    /// the id and the bound port.
    pub fn open_datagram(&self, at: SocketAddrV4) -> Result<(ConnId, u16)> {
        self.check_running()?;
        let fd = sys::udp_socket(at)?;
        let local = sys::local_addr(fd.as_raw_fd())?;
        let id = self.register_receiving(fd, ConnRole::Datagram, Some(local), None)?;
        kdebug!("datagram {} bound to {}", id, local);
        Ok((id, local.port()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initialized,
    Running,
    Stopped,
}

pub(crate) struct Engine {
    shared: Arc<Shared>,
    workers: WorkerPool,
    state: State,
}

impl Engine {
    pub fn init(config: EngineConfig, thread_name: &'static str) -> Result<Self> {
        cqnet_core::kprint::init();
        let shared = Arc::new(Shared::new(config)?);
        Ok(Self {
            shared,
            workers: WorkerPool::new(thread_name),
            state: State::Initialized,
        })
    }

    #[inline]
    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    /// Launch the workers. Returns false if they were already running.
    pub fn start<F>(&mut self, worker_fn: F) -> Result<bool>
    where
        F: Fn(usize, &AtomicBool) + Send + Sync + Clone + 'static,
    {
        match self.state {
            State::Running => return Ok(false),
            State::Stopped => return Err(NetError::Unsupported("restart after stop")),
            State::Initialized => {}
        }
        let n = self.shared.config.worker_count();
        self.shared.running.store(true, Ordering::Release);
        if let Err(e) = self.workers.start(n, worker_fn) {
            self.shared.running.store(false, Ordering::Release);
            self.workers.join_bounded(self.shared.config.join_timeout);
            self.state = State::Stopped;
            return Err(e);
        }
        self.state = State::Running;
        kinfo!(
            "engine started: {} workers on {}",
            self.workers.num_workers(),
            self.shared.queue.name()
        );
        Ok(true)
    }

    /// Stop workers and force-close every connection. Idempotent.
    pub fn stop(&mut self) {
        if self.state == State::Stopped {
            return;
        }
        self.shared.running.store(false, Ordering::Release);
        self.workers.shutdown();
        let detached = self.workers.join_bounded(self.shared.config.join_timeout);
        if detached > 0 {
            kwarn!("{} worker(s) detached at stop", detached);
        }
        let closed = self.shared.conns.deactivate_all();
        self.state = State::Stopped;
        kinfo!("engine stopped ({} connections closed)", closed);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
        let shared = &self.shared;
        let leftover = shared.queue.drain(shared.config.drain_grace);
        for op in leftover {
            shared.io.release(op);
        }
        kdebug!(
            "engine torn down: io live={} conn live={}",
            shared.io.live(),
            shared.conns.live()
        );
    }
}
