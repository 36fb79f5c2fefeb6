//! `UringQueue`: io_uring completion queue.
//!
//! One ring shared by every worker of an engine. Producers push SQEs under
//! `sq_lock` and submit immediately; waiters block in `io_uring_enter`
//! with a timeout (`IORING_ENTER_EXT_ARG`) without holding any lock and
//! reap CQEs one at a time under `cq_lock`, so each completion is handed
//! to exactly one worker.
//!
//! `user_data` of every SQE is the address of the boxed [`IoOperation`]
//! it was built from (`Box::into_raw`). The box is rebuilt exactly once
//! when its CQE is reaped. No multishot opcodes are used, so there is
//! never more than one CQE per SQE.
//!
//! Requires kernel 5.11+ (ext-arg waits); `new` fails cleanly otherwise.

use cqnet_core::completion::{Completion, CompletionQueue, PostError, WaitOutcome};
use cqnet_core::error::{NetError, Result};
use cqnet_core::id::ConnId;
use cqnet_core::op::{IoOperation, OpKind};
use cqnet_core::{kdebug, kwarn};

use io_uring::{opcode, squeue, types, IoUring, Probe};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Opcodes the stream and datagram workers rely on.
const REQUIRED_OPCODES: [u8; 5] = [
    opcode::Accept::CODE,
    opcode::Recv::CODE,
    opcode::Send::CODE,
    opcode::RecvMsg::CODE,
    opcode::SendMsg::CODE,
];

const DRAIN_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct UringQueueConfig {
    /// Submission queue entries. Rounded up to a power of 2 by the kernel.
    pub entries: u32,
}

impl Default for UringQueueConfig {
    fn default() -> Self {
        Self { entries: 1024 }
    }
}

pub struct UringQueue {
    ring: IoUring,
    sq_lock: Mutex<()>,
    cq_lock: Mutex<()>,
    in_flight: AtomicUsize,
}

// Safety: the shared submission queue is only touched under `sq_lock` and
// the shared completion queue only under `cq_lock`. `io_uring_enter` is
// safe to call from several threads at once; the kernel serializes it.
unsafe impl Send for UringQueue {}
unsafe impl Sync for UringQueue {}

fn guard(m: &Mutex<()>) -> MutexGuard<'_, ()> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl UringQueue {
    pub fn new(config: UringQueueConfig) -> Result<Self> {
        let ring = IoUring::builder()
            .build(config.entries)
            .map_err(|e| NetError::QueueSetup(e.raw_os_error().unwrap_or(libc::EIO)))?;

        if !ring.params().is_feature_ext_arg() {
            return Err(NetError::QueueSetup(libc::ENOSYS));
        }

        let mut probe = Probe::new();
        ring.submitter()
            .register_probe(&mut probe)
            .map_err(|e| NetError::QueueSetup(e.raw_os_error().unwrap_or(libc::EIO)))?;
        if let Some(missing) = REQUIRED_OPCODES.iter().find(|&&code| !probe.is_supported(code)) {
            kdebug!("io_uring: opcode {} not supported", missing);
            return Err(NetError::QueueSetup(libc::EOPNOTSUPP));
        }

        Ok(Self {
            ring,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Translate an operation into an SQE. Pointers in the entry refer to
    /// the operation's own heap allocation.
    fn build_sqe(fd: RawFd, op: &mut IoOperation) -> Option<squeue::Entry> {
        let fd = types::Fd(fd);
        let sqe = match (op.kind(), op.is_datagram()) {
            (OpKind::Accept, _) => {
                let (addr, len) = op.addr_ptr();
                opcode::Accept::new(fd, addr, len)
                    .flags(libc::SOCK_CLOEXEC)
                    .build()
            }
            (OpKind::Receive, false) => {
                let (buf, len) = op.recv_buf_ptr();
                opcode::Recv::new(fd, buf, len as u32).build()
            }
            (OpKind::Receive, true) => opcode::RecvMsg::new(fd, op.msghdr_ptr()).build(),
            (OpKind::Send, false) => {
                let (buf, len) = op.send_buf_ptr();
                opcode::Send::new(fd, buf, len as u32)
                    .flags(libc::MSG_NOSIGNAL)
                    .build()
            }
            (OpKind::Send, true) => {
                let msg = op.msghdr_ptr() as *const libc::msghdr;
                opcode::SendMsg::new(fd, msg)
                    .flags(libc::MSG_NOSIGNAL as u32)
                    .build()
            }
            (OpKind::Idle, _) => return None,
        };
        Some(sqe)
    }

    fn push(&self, sqe: &squeue::Entry) -> bool {
        // Safety: caller holds `sq_lock`; the entry's buffers outlive it.
        unsafe { self.ring.submission_shared().push(sqe).is_ok() }
    }

    /// Take one CQE and rebuild its operation.
    fn reap(&self) -> Option<Completion> {
        let _cq = guard(&self.cq_lock);
        // Safety: `cq_lock` makes this the only consumer. Dropping the
        // view publishes the new head to the kernel.
        let mut cq = unsafe { self.ring.completion_shared() };
        for cqe in &mut cq {
            let user_data = cqe.user_data();
            if user_data == 0 {
                continue;
            }
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            // Safety: every SQE we submit carries a pointer produced by
            // `Box::into_raw` in `post`, and yields exactly one CQE.
            let op = unsafe { Box::from_raw(user_data as *mut IoOperation) };
            return Some(Completion::new(op, cqe.result()));
        }
        None
    }
}

impl CompletionQueue for UringQueue {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn bind(&self, _fd: RawFd, _conn: ConnId) -> Result<()> {
        // io_uring needs no per-socket registration.
        Ok(())
    }

    fn post(&self, fd: RawFd, mut op: Box<IoOperation>) -> std::result::Result<(), PostError> {
        let sqe = match Self::build_sqe(fd, &mut op) {
            Some(sqe) => sqe,
            None => return Err(PostError { error: NetError::Unsupported("idle operation"), op }),
        };
        let raw = Box::into_raw(op);
        let sqe = sqe.user_data(raw as u64);

        let _sq = guard(&self.sq_lock);
        let mut pushed = self.push(&sqe);
        if !pushed {
            // SQ full: hand what is queued to the kernel and retry once.
            let _ = self.ring.submitter().submit();
            pushed = self.push(&sqe);
        }
        if !pushed {
            // Safety: the entry never reached the ring; `raw` is still ours.
            let op = unsafe { Box::from_raw(raw) };
            return Err(PostError { error: NetError::QueueFull, op });
        }
        self.in_flight.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.ring.submitter().submit() {
            match e.raw_os_error() {
                // Entry stays queued and goes out with the next enter.
                Some(libc::EBUSY) | Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                code => kwarn!("io_uring: submit failed: errno {:?}", code),
            }
        }
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(done) = self.reap() {
                return WaitOutcome::Completed(done);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return WaitOutcome::Timeout;
            }
            let ts = types::Timespec::new()
                .sec(left.as_secs())
                .nsec(left.subsec_nanos());
            let args = types::SubmitArgs::new().timespec(&ts);
            if let Err(e) = self.ring.submitter().submit_with_args(1, &args) {
                match e.raw_os_error() {
                    Some(libc::ETIME | libc::EINTR | libc::EBUSY | libc::EAGAIN) => {}
                    code => {
                        let errno = code.unwrap_or(libc::EIO);
                        return WaitOutcome::Failed(NetError::QueueSubmit(errno));
                    }
                }
            }
        }
    }

    fn unbind(&self, _fd: RawFd) -> Vec<Box<IoOperation>> {
        // In-flight operations stay with the kernel; shutdown() makes them
        // complete and they come back through `wait`.
        Vec::new()
    }

    fn drain(&self, grace: Duration) -> Vec<Box<IoOperation>> {
        let deadline = Instant::now() + grace;
        let mut ops = Vec::new();
        while self.in_flight() > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match self.wait(left.min(DRAIN_STEP)) {
                WaitOutcome::Completed(done) => ops.push(done.op),
                WaitOutcome::Timeout => {}
                WaitOutcome::Failed(e) => {
                    kwarn!("io_uring: drain stopped: {}", e);
                    break;
                }
            }
        }
        let stuck = self.in_flight();
        if stuck > 0 {
            // Their buffers must outlive the kernel's use: leak them.
            kwarn!("io_uring: {} operations never completed; leaking their buffers", stuck);
        }
        ops
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}
