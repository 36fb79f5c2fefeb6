//! `EventFdWaker`: wakes threads blocked in `epoll_wait`.
//!
//! Registered level-triggered in the epoll set: while the counter is
//! non-zero every waiter sees it readable, so one `wake()` releases all
//! blocked workers until somebody `drain()`s it. Multiple wakes before a
//! drain coalesce (eventfd counter semantics).

use cqnet_core::error::{last_errno, NetError, Result};

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub struct EventFdWaker {
    fd: OwnedFd,
}

impl EventFdWaker {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(NetError::QueueSetup(last_errno()));
        }
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    pub fn wake(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN: counter saturated, a wakeup is already pending.
        if ret < 0 && last_errno() != libc::EAGAIN {
            cqnet_core::kwarn!("eventfd wake failed: errno {}", last_errno());
        }
    }

    /// Reset the counter. Returns how many wakes were pending.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret == std::mem::size_of::<u64>() as isize {
            val
        } else {
            0
        }
    }
}

impl AsRawFd for EventFdWaker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakes_coalesce() {
        let w = EventFdWaker::new().unwrap();
        assert_eq!(w.drain(), 0);
        w.wake();
        w.wake();
        w.wake();
        assert_eq!(w.drain(), 3);
        assert_eq!(w.drain(), 0);
    }
}
