//! `EpollQueue`: completion queue emulated on epoll readiness.
//!
//! Used where io_uring is unavailable (old kernels, container seccomp
//! profiles that block `io_uring_setup`).
//!
//! Every bound socket has a [`Slot`] with room for one read-side operation
//! (Accept or Receive) and one Send. The socket is registered
//! `EPOLLONESHOT` for the union of what its slot holds; the worker that
//! dequeues the readiness event performs the non-blocking syscalls itself
//! and returns the results as completions.
//!
//! - Accept/Receive are always parked first and run on `EPOLLIN`.
//! - Send is tried at post time. If anything went out (or the socket
//!   failed) the completion goes to a ready queue and an eventfd wakes one
//!   waiter. A send that would block is parked and finished on `EPOLLOUT`;
//!   `EAGAIN` never surfaces as a completion error and `post` never waits.
//!
//! Syscalls on a socket run while holding the `armed` lock; `unbind` takes
//! the same lock, so once it returns no worker can touch the descriptor.

use crate::sys;
use crate::waker::EventFdWaker;

use cqnet_core::completion::{Completion, CompletionQueue, PostError, WaitOutcome};
use cqnet_core::error::{last_errno, NetError, Result};
use cqnet_core::id::ConnId;
use cqnet_core::op::{IoOperation, OpKind};
use cqnet_core::{kdebug, ktrace};

use crossbeam_queue::SegQueue;
use nix::sys::epoll::{Epoll, EpollCreateFlags};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

const WAKE_TOKEN: u64 = u64::MAX;
const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;
const FAIL_EVENTS: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Operations parked on one socket, waiting for readiness.
#[derive(Default)]
struct Slot {
    read: Option<Box<IoOperation>>,
    write: Option<Box<IoOperation>>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    fn events(&self) -> u32 {
        let mut events = libc::EPOLLONESHOT as u32;
        if self.read.is_some() {
            events |= READ_EVENTS;
        }
        if self.write.is_some() {
            events |= WRITE_EVENTS;
        }
        events
    }

    fn take_all(&mut self) -> impl Iterator<Item = Box<IoOperation>> {
        self.read.take().into_iter().chain(self.write.take())
    }
}

type Slots = HashMap<RawFd, Slot>;

pub struct EpollQueue {
    epoll: Epoll,
    waker: EventFdWaker,
    armed: Mutex<Slots>,
    ready: SegQueue<Completion>,
    /// Operations owned by the queue: parked in a slot or sitting in `ready`.
    in_flight: AtomicUsize,
}

impl EpollQueue {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| NetError::QueueSetup(e as i32))?;
        let waker = EventFdWaker::new()?;
        let queue = Self {
            epoll,
            waker,
            armed: Mutex::new(HashMap::new()),
            ready: SegQueue::new(),
            in_flight: AtomicUsize::new(0),
        };
        // Level-triggered: stays readable for every waiter until drained.
        queue
            .ctl(libc::EPOLL_CTL_ADD, queue.waker.as_raw_fd(), libc::EPOLLIN as u32, WAKE_TOKEN)
            .map_err(NetError::QueueSetup)?;
        Ok(queue)
    }

    fn epfd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }

    fn armed(&self) -> MutexGuard<'_, Slots> {
        self.armed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32, data: u64) -> std::result::Result<(), i32> {
        let mut ev = libc::epoll_event { events, u64: data };
        if unsafe { libc::epoll_ctl(self.epfd(), op, fd, &mut ev) } < 0 {
            return Err(last_errno());
        }
        Ok(())
    }

    /// Register interest in everything `slot` is waiting for.
    fn arm(&self, fd: RawFd, slot: &Slot) -> std::result::Result<(), i32> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, slot.events(), fd as u64)
    }

    fn push_ready(&self, completion: Completion) {
        self.ready.push(completion);
        self.waker.wake();
    }

    /// Run the parked Accept/Receive. `None` if it would still block.
    fn try_read(fd: RawFd, slot: &mut Slot) -> Option<Completion> {
        let mut op = slot.read.take()?;
        let ret = match (op.kind(), op.is_datagram()) {
            (OpKind::Accept, _) => {
                let (addr, len) = op.addr_ptr();
                let flags = libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK;
                unsafe { libc::accept4(fd, addr, len, flags) as isize }
            }
            (OpKind::Receive, false) => {
                let (buf, len) = op.recv_buf_ptr();
                unsafe { libc::recv(fd, buf as *mut libc::c_void, len, libc::MSG_DONTWAIT) }
            }
            (OpKind::Receive, true) => {
                let msg = op.msghdr_ptr();
                unsafe { libc::recvmsg(fd, msg, libc::MSG_DONTWAIT) }
            }
            _ => return Some(Completion::new(op, -libc::EINVAL)),
        };
        if ret >= 0 {
            return Some(Completion::new(op, ret as i32));
        }
        match last_errno() {
            libc::EAGAIN | libc::EINTR => {
                slot.read = Some(op);
                None
            }
            e => Some(Completion::new(op, -e)),
        }
    }

    /// Write as much of the unsent payload as the socket takes right now.
    ///
    /// Returns bytes written or `-errno`, or `None` when nothing could be
    /// written without blocking.
    fn send_now(fd: RawFd, op: &mut IoOperation) -> Option<i32> {
        if op.is_datagram() {
            loop {
                let msg = op.msghdr_ptr();
                let n = unsafe { libc::sendmsg(fd, msg, libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT) };
                if n >= 0 {
                    return Some(n as i32);
                }
                match last_errno() {
                    libc::EINTR => continue,
                    libc::EAGAIN => return None,
                    e => return Some(-e),
                }
            }
        }

        let data = op.unsent();
        let mut off = 0usize;
        while off < data.len() {
            let rest = &data[off..];
            let n = unsafe {
                libc::send(
                    fd,
                    rest.as_ptr() as *const libc::c_void,
                    rest.len(),
                    libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
                )
            };
            if n > 0 {
                off += n as usize;
                continue;
            }
            if n == 0 {
                break;
            }
            match last_errno() {
                libc::EINTR => {}
                libc::EAGAIN if off == 0 => return None,
                // Report what went out; the remainder is re-posted.
                _ if off > 0 => break,
                e => return Some(-e),
            }
        }
        Some(off as i32)
    }

    /// Run the parked Send. `None` if the socket is still full.
    fn try_write(fd: RawFd, slot: &mut Slot) -> Option<Completion> {
        let mut op = slot.write.take()?;
        match Self::send_now(fd, &mut op) {
            Some(result) => Some(Completion::new(op, result)),
            None => {
                slot.write = Some(op);
                None
            }
        }
    }

    /// Handle one readiness event for `fd`. Called with the `armed` lock
    /// held. Whatever stays parked is re-armed; if that fails the parked
    /// operations complete with the error.
    fn service(&self, armed: &mut Slots, fd: RawFd, events: u32) -> [Option<Completion>; 2] {
        let Some(slot) = armed.get_mut(&fd) else { return [None, None] };
        let failed = events & FAIL_EVENTS != 0;
        let read = if failed || events & READ_EVENTS != 0 {
            Self::try_read(fd, slot)
        } else {
            None
        };
        let write = if failed || events & WRITE_EVENTS != 0 {
            Self::try_write(fd, slot)
        } else {
            None
        };

        if slot.is_empty() {
            armed.remove(&fd);
        } else if let Err(errno) = self.arm(fd, slot) {
            for op in slot.take_all() {
                self.push_ready(Completion::new(op, -errno));
            }
            armed.remove(&fd);
        }
        [read, write]
    }

    /// Park `op` in the read or write half of `fd`'s slot and arm the
    /// socket for it. Arming happens under the lock, so a racing worker
    /// always finds the operation.
    fn park(
        &self,
        armed: &mut Slots,
        fd: RawFd,
        op: Box<IoOperation>,
        write: bool,
    ) -> std::result::Result<(), PostError> {
        let slot = armed.entry(fd).or_default();
        let (taken, wanted) = if write {
            (slot.write.is_some(), WRITE_EVENTS)
        } else {
            (slot.read.is_some(), READ_EVENTS)
        };
        let armed_ok = if taken {
            Err(NetError::Unsupported("operation already armed on socket"))
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, slot.events() | wanted, fd as u64)
                .map_err(NetError::QueueSubmit)
        };
        if let Err(error) = armed_ok {
            if slot.is_empty() {
                armed.remove(&fd);
            }
            return Err(PostError { error, op });
        }
        if write {
            slot.write = Some(op);
        } else {
            slot.read = Some(op);
        }
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn post_send(&self, fd: RawFd, mut op: Box<IoOperation>) -> std::result::Result<(), PostError> {
        let mut armed = self.armed();
        if armed.get(&fd).is_some_and(|slot| slot.write.is_some()) {
            let error = NetError::Unsupported("send already waiting on socket");
            return Err(PostError { error, op });
        }
        match Self::send_now(fd, &mut op) {
            Some(result) => {
                self.in_flight.fetch_add(1, Ordering::Relaxed);
                self.push_ready(Completion::new(op, result));
                Ok(())
            }
            None => {
                ktrace!("epoll: fd {} full, send waits for EPOLLOUT", fd);
                self.park(&mut armed, fd, op, true)
            }
        }
    }
}

impl CompletionQueue for EpollQueue {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn bind(&self, fd: RawFd, conn: ConnId) -> Result<()> {
        sys::set_nonblocking(fd)?;
        // Registered disarmed; `post` arms it per operation.
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLONESHOT as u32, fd as u64)
            .map_err(NetError::QueueSubmit)?;
        ktrace!("epoll: bound fd {} for conn {}", fd, conn);
        Ok(())
    }

    fn post(&self, fd: RawFd, op: Box<IoOperation>) -> std::result::Result<(), PostError> {
        match op.kind() {
            OpKind::Accept | OpKind::Receive => self.park(&mut self.armed(), fd, op, false),
            OpKind::Send => self.post_send(fd, op),
            OpKind::Idle => Err(PostError { error: NetError::Unsupported("idle operation"), op }),
        }
    }

    fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        loop {
            if let Some(done) = self.ready.pop() {
                if !self.ready.is_empty() {
                    self.waker.wake();
                }
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                return WaitOutcome::Completed(done);
            }

            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return WaitOutcome::Timeout;
            }
            let ms = left.as_millis().clamp(1, i32::MAX as u128) as i32;
            let n = unsafe { libc::epoll_wait(self.epfd(), &mut event, 1, ms) };
            if n < 0 {
                match last_errno() {
                    libc::EINTR => continue,
                    e => return WaitOutcome::Failed(NetError::Os(e)),
                }
            }
            if n == 0 {
                continue;
            }

            let token = event.u64;
            if token == WAKE_TOKEN {
                self.waker.drain();
                continue;
            }
            let [first, second] = {
                let mut armed = self.armed();
                self.service(&mut armed, token as RawFd, event.events)
            };
            let mut done = first.into_iter().chain(second);
            if let Some(c) = done.next() {
                if let Some(other) = done.next() {
                    self.push_ready(other);
                }
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                return WaitOutcome::Completed(c);
            }
        }
    }

    fn unbind(&self, fd: RawFd) -> Vec<Box<IoOperation>> {
        let mut armed = self.armed();
        let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0);
        let ops: Vec<_> = match armed.remove(&fd) {
            Some(mut slot) => slot.take_all().collect(),
            None => Vec::new(),
        };
        self.in_flight.fetch_sub(ops.len(), Ordering::Relaxed);
        ops
    }

    fn drain(&self, _grace: Duration) -> Vec<Box<IoOperation>> {
        // Nothing here is owned by the kernel; reclaiming is immediate.
        let mut ops: Vec<Box<IoOperation>> = Vec::new();
        for (_, mut slot) in self.armed().drain() {
            ops.extend(slot.take_all());
        }
        while let Some(done) = self.ready.pop() {
            ops.push(done.op);
        }
        self.in_flight.store(0, Ordering::Relaxed);
        if !ops.is_empty() {
            kdebug!("epoll: drained {} operations", ops.len());
        }
        ops
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}
