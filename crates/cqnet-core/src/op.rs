//! I/O operation descriptors.
//!
//! An [`IoOperation`] is one asynchronous request: its buffer, what it is
//! for, which connection it belongs to and the peer address slot the
//! kernel fills for accept and datagram receive. Operations always live in
//! a `Box`; the box's heap address is the completion token, so an
//! operation must not move while a completion queue holds it.
//!
//! Ownership moves strictly: pool → connection or caller → queue (in
//! flight) → worker → pool. Nothing else aliases an operation.

use crate::addr;
use crate::error::{NetError, Result};
use crate::id::ConnId;
use std::net::SocketAddrV4;

/// Capacity of every pooled I/O buffer.
pub const IO_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Idle,
    Accept,
    Receive,
    Send,
}

pub struct IoOperation {
    buf: Box<[u8]>,
    /// Valid bytes in `buf`: payload for sends, data for completed receives.
    len: usize,
    /// Send progress across short writes.
    sent: usize,
    kind: OpKind,
    /// Carries a peer address (recvmsg/sendmsg) instead of stream recv/send.
    datagram: bool,
    conn: ConnId,
    addr: libc::sockaddr_in,
    addr_len: libc::socklen_t,
    iov: libc::iovec,
    msg: libc::msghdr,
}

// Safety: the raw pointers in `iov`/`msg` only ever point into this same
// heap allocation (refreshed by `msghdr_ptr`). Moving the Box between
// threads moves the pointees with it.
unsafe impl Send for IoOperation {}

impl IoOperation {
    pub fn new() -> Box<Self> {
        Self::with_capacity(IO_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Box<Self> {
        Box::new(Self {
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            len: 0,
            sent: 0,
            kind: OpKind::Idle,
            datagram: false,
            conn: ConnId::NONE,
            addr: unsafe { std::mem::zeroed() },
            addr_len: addr::sockaddr_len(),
            iov: libc::iovec { iov_base: std::ptr::null_mut(), iov_len: 0 },
            msg: unsafe { std::mem::zeroed() },
        })
    }

    /// Back to Idle; the buffer is zeroed only up to what was used.
    pub fn reset(&mut self) {
        let used = self.len.min(self.buf.len());
        self.buf[..used].fill(0);
        self.len = 0;
        self.sent = 0;
        self.kind = OpKind::Idle;
        self.datagram = false;
        self.conn = ConnId::NONE;
        self.addr = unsafe { std::mem::zeroed() };
        self.addr_len = addr::sockaddr_len();
        self.iov = libc::iovec { iov_base: std::ptr::null_mut(), iov_len: 0 };
        self.msg = unsafe { std::mem::zeroed() };
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    #[inline]
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    #[inline]
    pub fn is_datagram(&self) -> bool {
        self.datagram
    }

    /// Stable address of this operation, used as the completion token.
    #[inline]
    pub fn token(&self) -> u64 {
        self as *const Self as u64
    }

    pub fn prepare_accept(&mut self, listener: ConnId) {
        self.reset();
        self.kind = OpKind::Accept;
        self.conn = listener;
    }

    pub fn prepare_receive(&mut self, conn: ConnId, datagram: bool) {
        self.reset();
        self.kind = OpKind::Receive;
        self.datagram = datagram;
        self.conn = conn;
    }

    pub fn prepare_send(&mut self, conn: ConnId, data: &[u8]) -> Result<()> {
        if data.len() > self.buf.len() {
            return Err(NetError::PayloadTooLarge { len: data.len(), max: self.buf.len() });
        }
        self.reset();
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        self.kind = OpKind::Send;
        self.conn = conn;
        Ok(())
    }

    pub fn prepare_send_to(&mut self, conn: ConnId, data: &[u8], dest: SocketAddrV4) -> Result<()> {
        self.prepare_send(conn, data)?;
        self.datagram = true;
        self.addr = addr::to_sockaddr(dest);
        Ok(())
    }

    /// Record a completed receive of `n` bytes and return them.
    pub fn complete_receive(&mut self, n: usize) -> &[u8] {
        self.len = n.min(self.buf.len());
        &self.buf[..self.len]
    }

    /// Bytes of the current receive or send payload.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Account for `n` bytes written. Returns true once the payload is out.
    pub fn advance_send(&mut self, n: usize) -> bool {
        self.sent = (self.sent + n).min(self.len);
        self.sent == self.len
    }

    /// Bytes of the send payload not yet written.
    #[inline]
    pub fn unsent(&self) -> &[u8] {
        &self.buf[self.sent..self.len]
    }

    /// Peer filled in by accept / datagram receive, or the send destination.
    pub fn peer(&self) -> Option<SocketAddrV4> {
        if self.addr.sin_family == libc::AF_INET as libc::sa_family_t {
            Some(addr::from_sockaddr(&self.addr))
        } else {
            None
        }
    }

    /// The last datagram receive did not fit the buffer and was cut short.
    pub fn is_truncated(&self) -> bool {
        self.datagram && self.msg.msg_flags & libc::MSG_TRUNC != 0
    }

    // ── Raw views for completion queue backends ──

    /// Whole buffer for a receive.
    pub fn recv_buf_ptr(&mut self) -> (*mut u8, usize) {
        (self.buf.as_mut_ptr(), self.buf.len())
    }

    /// Unsent remainder of a send.
    pub fn send_buf_ptr(&self) -> (*const u8, usize) {
        let rest = self.unsent();
        (rest.as_ptr(), rest.len())
    }

    /// Address slot for accept/recvfrom; the length is reset to full size.
    pub fn addr_ptr(&mut self) -> (*mut libc::sockaddr, *mut libc::socklen_t) {
        self.addr_len = addr::sockaddr_len();
        (
            &mut self.addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut self.addr_len,
        )
    }

    /// `msghdr` for recvmsg/sendmsg pointing back into this operation.
    ///
    /// Receive: the whole buffer with the address slot as `msg_name`.
    /// Send: the unsent remainder with the destination as `msg_name`.
    pub fn msghdr_ptr(&mut self) -> *mut libc::msghdr {
        let (base, len) = match self.kind {
            OpKind::Send => {
                let (p, l) = self.send_buf_ptr();
                (p as *mut u8, l)
            }
            _ => self.recv_buf_ptr(),
        };
        self.iov = libc::iovec { iov_base: base as *mut libc::c_void, iov_len: len };
        self.addr_len = addr::sockaddr_len();
        self.msg = unsafe { std::mem::zeroed() };
        self.msg.msg_name = &mut self.addr as *mut libc::sockaddr_in as *mut libc::c_void;
        self.msg.msg_namelen = self.addr_len;
        self.msg.msg_iov = &mut self.iov;
        self.msg.msg_iovlen = 1;
        &mut self.msg
    }
}

impl std::fmt::Debug for IoOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoOperation")
            .field("kind", &self.kind)
            .field("conn", &self.conn)
            .field("len", &self.len)
            .field("sent", &self.sent)
            .field("datagram", &self.datagram)
            .finish()
    }
}
