//! `Connection` records and the `ConnectionPool`.
//!
//! A connection is shared as `Arc<Connection>`; its mutable state sits
//! behind one mutex. Posting an operation and closing the socket both take
//! that mutex, so an operation is never posted on a descriptor that has
//! been closed (and possibly reused by the kernel for another socket).
//!
//! Sends are serialized per connection: one send is in flight, later ones
//! wait in a FIFO and are posted as the previous one completes. A short
//! write re-posts its own remainder first, so bytes leave in call order.
//!
//! Lock order: active map → (released) → connection → completion queue
//! internals. No lock is held while user callbacks run.
//!
//! ```text
//!   acquire ──► attach ──► activate ──► ... ──► deactivate ──► release
//!     ▲          (fd,id)   (map insert)          (map remove)   (reset)
//!     └───────────────────────── idle list ◄──────────────────────┘
//! ```

use crate::io_pool::IoBufferPool;
use crate::sys;

use cqnet_core::completion::{CompletionQueue, PostError};
use cqnet_core::error::{NetError, Result};
use cqnet_core::id::ConnId;
use cqnet_core::op::IoOperation;
use cqnet_core::{kdebug, ktrace};

use crossbeam_queue::ArrayQueue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Stream,
    Listener,
    Datagram,
}

struct ConnState {
    id: ConnId,
    fd: Option<OwnedFd>,
    role: ConnRole,
    local: Option<SocketAddrV4>,
    peer: Option<SocketAddrV4>,
    /// Parked receive operation. `None` while it is in flight.
    recv_op: Option<Box<IoOperation>>,
    /// Tokens of send/accept operations in flight for this connection.
    pending: HashSet<u64>,
    /// Sends waiting for the in-flight one to finish.
    send_queue: VecDeque<Box<IoOperation>>,
    sending: bool,
}

impl ConnState {
    /// Descriptor to post `op` on, if the socket is open and `op` was
    /// prepared for this connection's current id.
    fn open_fd_for(&self, op: &IoOperation) -> Option<RawFd> {
        match &self.fd {
            Some(fd) if self.id == op.conn() => Some(fd.as_raw_fd()),
            _ => None,
        }
    }

    fn post_tracked(
        &mut self,
        queue: &dyn CompletionQueue,
        fd: RawFd,
        op: Box<IoOperation>,
    ) -> std::result::Result<(), PostError> {
        let token = op.token();
        self.pending.insert(token);
        queue.post(fd, op).map_err(|e| {
            self.pending.remove(&token);
            e
        })
    }
}

pub struct Connection {
    state: Mutex<ConnState>,
}

impl Connection {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnState {
                id: ConnId::NONE,
                fd: None,
                role: ConnRole::Stream,
                local: None,
                peer: None,
                recv_op: None,
                pending: HashSet::new(),
                send_queue: VecDeque::new(),
                sending: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        // A panicking callback never holds this lock; poisoning only means
        // a worker died mid-update and the state is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> ConnId {
        self.lock().id
    }

    pub fn role(&self) -> ConnRole {
        self.lock().role
    }

    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.lock().local
    }

    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.lock().peer
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.lock().fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn is_open(&self) -> bool {
        self.lock().fd.is_some()
    }

    /// Send/accept operations currently in flight.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Give an idle connection its socket and identity.
    pub fn attach(
        &self,
        fd: OwnedFd,
        id: ConnId,
        role: ConnRole,
        local: Option<SocketAddrV4>,
        peer: Option<SocketAddrV4>,
        recv_op: Option<Box<IoOperation>>,
    ) {
        let mut st = self.lock();
        st.fd = Some(fd);
        st.id = id;
        st.role = role;
        st.local = local;
        st.peer = peer;
        st.recv_op = recv_op;
    }

    /// Post the parked receive operation.
    ///
    /// Fails with `Closed` once the socket is gone. At most one receive
    /// is ever in flight: with the operation already posted this returns
    /// `Unsupported`.
    pub fn post_receive(&self, queue: &dyn CompletionQueue) -> Result<()> {
        let mut st = self.lock();
        let fd = match &st.fd {
            Some(fd) => fd.as_raw_fd(),
            None => return Err(NetError::Closed),
        };
        let mut op = match st.recv_op.take() {
            Some(op) => op,
            None => return Err(NetError::Unsupported("receive already in flight")),
        };
        op.prepare_receive(st.id, st.role == ConnRole::Datagram);
        match queue.post(fd, op) {
            Ok(()) => Ok(()),
            Err(PostError { error, op }) => {
                st.recv_op = Some(op);
                Err(error)
            }
        }
    }

    /// Take back a completed receive operation for re-posting.
    ///
    /// Returns the operation if this connection no longer wants it
    /// (closed, or re-opened under another id); the caller releases it.
    pub fn park_receive(&self, op: Box<IoOperation>) -> Option<Box<IoOperation>> {
        let mut st = self.lock();
        if st.fd.is_none() || st.id != op.conn() || st.recv_op.is_some() {
            return Some(op);
        }
        st.recv_op = Some(op);
        None
    }

    /// Post an accept on a listener and remember its token.
    pub fn post_accept(
        &self,
        queue: &dyn CompletionQueue,
        op: Box<IoOperation>,
    ) -> std::result::Result<(), PostError> {
        let mut st = self.lock();
        let fd = match st.open_fd_for(&op) {
            Some(fd) => fd,
            None => return Err(PostError { error: NetError::Closed, op }),
        };
        st.post_tracked(queue, fd, op)
    }

    /// Post a send, or queue it behind the send already in flight.
    pub fn post_send(
        &self,
        queue: &dyn CompletionQueue,
        op: Box<IoOperation>,
    ) -> std::result::Result<(), PostError> {
        let mut st = self.lock();
        let fd = match st.open_fd_for(&op) {
            Some(fd) => fd,
            None => return Err(PostError { error: NetError::Closed, op }),
        };
        if st.sending {
            st.send_queue.push_back(op);
            return Ok(());
        }
        st.post_tracked(queue, fd, op)?;
        st.sending = true;
        Ok(())
    }

    /// Re-post the unsent remainder of a short write. The token stays
    /// pending; the queued sends keep waiting.
    pub fn resume_send(
        &self,
        queue: &dyn CompletionQueue,
        op: Box<IoOperation>,
    ) -> std::result::Result<(), PostError> {
        let st = self.lock();
        let fd = match st.open_fd_for(&op) {
            Some(fd) => fd,
            None => return Err(PostError { error: NetError::Closed, op }),
        };
        queue.post(fd, op)
    }

    /// The send with `token` is fully written: post the next queued one.
    ///
    /// On failure the rejected operation is handed back and the queue is
    /// left as is; the caller is expected to tear the connection down.
    pub fn finish_send(
        &self,
        queue: &dyn CompletionQueue,
        token: u64,
    ) -> std::result::Result<(), PostError> {
        let mut st = self.lock();
        st.pending.remove(&token);
        let next = match st.send_queue.pop_front() {
            Some(next) => next,
            None => {
                st.sending = false;
                return Ok(());
            }
        };
        let fd = match st.open_fd_for(&next) {
            Some(fd) => fd,
            None => {
                st.sending = false;
                return Err(PostError { error: NetError::Closed, op: next });
            }
        };
        st.post_tracked(queue, fd, next).map_err(|e| {
            st.sending = false;
            e
        })
    }

    /// Forget a finished accept.
    pub fn complete_tracked(&self, token: u64) -> bool {
        self.lock().pending.remove(&token)
    }

    /// Sends waiting behind the in-flight one.
    pub fn queued_sends(&self) -> usize {
        self.lock().send_queue.len()
    }

    /// Zero-length send liveness check. `Err(errno)` if the peer is gone.
    pub fn probe(&self) -> std::result::Result<(), i32> {
        let st = self.lock();
        match &st.fd {
            Some(fd) if st.role == ConnRole::Stream => sys::probe_alive(fd.as_raw_fd()),
            Some(_) => Ok(()),
            None => Err(libc::EBADF),
        }
    }

    /// Close the socket and return owned operations to `io`.
    ///
    /// Operations the kernel still holds come back through the queue
    /// later; their connection id no longer resolves and the worker that
    /// reaps them releases them.
    fn reset(&self, queue: &dyn CompletionQueue, io: &IoBufferPool) {
        let mut st = self.lock();
        if let Some(fd) = st.fd.take() {
            let raw = fd.as_raw_fd();
            for op in queue.unbind(raw) {
                io.release(op);
            }
            sys::shutdown(raw);
            drop(fd);
            ktrace!("conn {} closed fd {}", st.id, raw);
        }
        if let Some(op) = st.recv_op.take() {
            io.release(op);
        }
        for op in st.send_queue.drain(..) {
            io.release(op);
        }
        st.sending = false;
        st.pending.clear();
        st.id = ConnId::NONE;
        st.role = ConnRole::Stream;
        st.local = None;
        st.peer = None;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("Connection")
            .field("id", &st.id)
            .field("role", &st.role)
            .field("open", &st.fd.is_some())
            .field("local", &st.local)
            .field("peer", &st.peer)
            .field("pending", &st.pending.len())
            .finish()
    }
}

/// Idle free list plus id-indexed map of active connections.
pub struct ConnectionPool {
    idle: ArrayQueue<Arc<Connection>>,
    active: Mutex<HashMap<ConnId, Arc<Connection>>>,
    io: Arc<IoBufferPool>,
    queue: Arc<dyn CompletionQueue>,
    generation: AtomicU32,
    live: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(capacity: usize, io: Arc<IoBufferPool>, queue: Arc<dyn CompletionQueue>) -> Self {
        Self {
            idle: ArrayQueue::new(capacity.max(1)),
            active: Mutex::new(HashMap::new()),
            io,
            queue,
            generation: AtomicU32::new(1),
            live: AtomicUsize::new(0),
        }
    }

    fn active_map(&self) -> MutexGuard<'_, HashMap<ConnId, Arc<Connection>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn io(&self) -> &Arc<IoBufferPool> {
        &self.io
    }

    pub fn queue(&self) -> &Arc<dyn CompletionQueue> {
        &self.queue
    }

    /// Fresh id for a connection on `fd`.
    pub fn next_id(&self, fd: RawFd) -> ConnId {
        let mut generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if generation == u32::MAX {
            generation = self.generation.fetch_add(1, Ordering::Relaxed);
        }
        ConnId::new(fd, generation)
    }

    /// An idle connection with no socket.
    pub fn acquire(&self) -> Arc<Connection> {
        match self.idle.pop() {
            Some(conn) => conn,
            None => {
                self.live.fetch_add(1, Ordering::Relaxed);
                Arc::new(Connection::new())
            }
        }
    }

    /// Acquire a connection and attach `fd` under a new id. Stream and
    /// datagram sockets get a receive operation from the buffer pool.
    pub fn open(
        &self,
        fd: OwnedFd,
        role: ConnRole,
        local: Option<SocketAddrV4>,
        peer: Option<SocketAddrV4>,
    ) -> Arc<Connection> {
        let conn = self.acquire();
        let id = self.next_id(fd.as_raw_fd());
        let recv_op = match role {
            ConnRole::Listener => None,
            ConnRole::Stream | ConnRole::Datagram => Some(self.io.acquire()),
        };
        conn.attach(fd, id, role, local, peer, recv_op);
        conn
    }

    /// Reset `conn` and keep it for reuse if the idle list has room and
    /// no one else still references it.
    pub fn release(&self, conn: Arc<Connection>) {
        conn.reset(self.queue.as_ref(), &self.io);
        if Arc::strong_count(&conn) != 1 || self.idle.push(conn).is_err() {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Publish `conn` under its id. False if the id is already active.
    pub fn activate(&self, conn: Arc<Connection>) -> bool {
        let id = conn.id();
        if id.is_none() {
            return false;
        }
        let mut map = self.active_map();
        if map.contains_key(&id) {
            return false;
        }
        map.insert(id, conn);
        kdebug!("conn {} active ({} total)", id, map.len());
        true
    }

    /// Remove `id` from the active map and release it.
    ///
    /// Returns true only for the call that performed the removal, which
    /// makes "fire Disconnected if deactivate() returned true" exactly-once.
    pub fn deactivate(&self, id: ConnId) -> bool {
        let removed = self.active_map().remove(&id);
        match removed {
            Some(conn) => {
                kdebug!("conn {} deactivated", id);
                self.release(conn);
                true
            }
            None => false,
        }
    }

    /// Deactivate every active connection. Returns how many there were.
    pub fn deactivate_all(&self) -> usize {
        let all: Vec<_> = self.active_map().drain().map(|(_, c)| c).collect();
        let n = all.len();
        for conn in all {
            self.release(conn);
        }
        n
    }

    pub fn lookup(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.active_map().get(&id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active_map().len()
    }

    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    pub fn capacity(&self) -> usize {
        self.idle.capacity()
    }

    /// Connections created by this pool and not yet destroyed.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoll_queue::EpollQueue;
    use std::net::Ipv4Addr;
    use std::os::unix::net::UnixStream;

    fn pool(capacity: usize) -> ConnectionPool {
        let io = Arc::new(IoBufferPool::new(16));
        let queue: Arc<dyn CompletionQueue> = Arc::new(EpollQueue::new().unwrap());
        ConnectionPool::new(capacity, io, queue)
    }

    fn socket() -> OwnedFd {
        let (a, _b) = UnixStream::pair().unwrap();
        OwnedFd::from(a)
    }

    #[test]
    fn test_ids_never_repeat() {
        let p = pool(4);
        let a = p.next_id(7);
        let b = p.next_id(7);
        assert_ne!(a, b);
        assert_eq!(a.fd(), 7);
        assert_eq!(b.fd(), 7);
    }

    #[test]
    fn test_activate_lookup_deactivate_once() {
        let p = pool(4);
        let conn = p.open(socket(), ConnRole::Stream, None, None);
        let id = conn.id();
        assert!(p.activate(conn.clone()));
        assert!(!p.activate(conn.clone()), "duplicate id must be rejected");
        assert!(p.lookup(id).is_some());
        drop(conn);

        assert!(p.deactivate(id));
        assert!(!p.deactivate(id));
        assert!(p.lookup(id).is_none());
        assert_eq!(p.active_count(), 0);
    }

    #[test]
    fn test_release_recycles_unshared_connection() {
        let p = pool(4);
        let conn = p.open(socket(), ConnRole::Stream, None, None);
        let id = conn.id();
        p.activate(conn);
        assert!(p.deactivate(id));
        assert_eq!(p.idle(), 1);
        assert_eq!(p.io().idle(), 1, "parked receive op returned to the buffer pool");

        let again = p.acquire();
        assert!(!again.is_open());
        assert_eq!(again.id(), ConnId::NONE);
        assert_eq!(p.live(), 1);
    }

    #[test]
    fn test_release_discards_shared_connection() {
        let p = pool(4);
        let conn = p.open(socket(), ConnRole::Stream, None, None);
        let id = conn.id();
        p.activate(conn.clone());
        assert!(p.deactivate(id));
        // Still referenced here, so it must not be handed out again.
        assert_eq!(p.idle(), 0);
        assert!(!conn.is_open());
        assert_eq!(p.live(), 0);
    }

    #[test]
    fn test_idle_list_bounded() {
        let p = pool(2);
        let conns: Vec<_> = (0..5).map(|_| p.acquire()).collect();
        assert_eq!(p.live(), 5);
        for c in conns {
            p.release(c);
        }
        assert_eq!(p.idle(), 2);
        assert_eq!(p.live(), 2);
    }

    #[test]
    fn test_post_on_closed_connection_hands_op_back() {
        let p = pool(2);
        let conn = p.acquire();
        let mut op = p.io().acquire();
        op.prepare_send(ConnId::new(3, 9), b"x").unwrap();
        let err = conn.post_send(p.queue().as_ref(), op).unwrap_err();
        assert!(matches!(err.error, NetError::Closed));
        assert_eq!(err.op.data(), b"x");
        assert!(matches!(conn.post_receive(p.queue().as_ref()), Err(NetError::Closed)));
    }

    #[test]
    fn test_sends_serialized_in_call_order() {
        use cqnet_core::completion::WaitOutcome;
        use std::io::Read;
        use std::time::Duration;

        let p = pool(2);
        let (a, mut b) = UnixStream::pair().unwrap();
        let conn = p.open(OwnedFd::from(a), ConnRole::Stream, None, None);
        let (id, fd) = (conn.id(), conn.raw_fd().unwrap());
        p.queue().bind(fd, id).unwrap();

        let mut first = p.io().acquire();
        first.prepare_send(id, b"one").unwrap();
        let first_token = first.token();
        let mut second = p.io().acquire();
        second.prepare_send(id, b"two").unwrap();

        conn.post_send(p.queue().as_ref(), first).unwrap();
        conn.post_send(p.queue().as_ref(), second).unwrap();
        assert_eq!(conn.queued_sends(), 1);
        assert_eq!(conn.pending(), 1);

        let done = match p.queue().wait(Duration::from_secs(1)) {
            WaitOutcome::Completed(c) => c,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(done.op.token(), first_token);
        conn.finish_send(p.queue().as_ref(), first_token).unwrap();
        assert_eq!(conn.queued_sends(), 0);

        let mut got = [0u8; 6];
        b.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"onetwo");
    }

    #[test]
    fn test_deactivate_all() {
        let p = pool(8);
        let local = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);
        for _ in 0..3 {
            let c = p.open(socket(), ConnRole::Stream, Some(local), None);
            assert_eq!(c.local_addr(), Some(local));
            p.activate(c);
        }
        assert_eq!(p.deactivate_all(), 3);
        assert_eq!(p.active_count(), 0);
        assert_eq!(p.idle(), 3);
    }
}
