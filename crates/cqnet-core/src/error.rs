//! cqnet error types.

use crate::id::ConnId;
use std::fmt;

#[derive(Debug)]
pub enum NetError {
    /// Completion queue could not be created.
    QueueSetup(i32),
    /// Completion queue refused a submission.
    QueueSubmit(i32),
    /// Submission ring has no free slot.
    QueueFull,
    /// socket/bind/listen/connect/setsockopt failed.
    Socket(i32),
    /// Not a dotted-quad IPv4 address (or `*`).
    InvalidAddress(String),
    /// Front-end used before `start()` or after `stop()`.
    NotStarted,
    /// No active connection with this id.
    NotFound(ConnId),
    /// The connection was closed while the operation was being posted.
    Closed,
    /// Datagram larger than one I/O buffer.
    PayloadTooLarge { len: usize, max: usize },
    /// Operation does not apply to this kind of connection.
    Unsupported(&'static str),
    /// Configuration value out of range.
    InvalidConfig(&'static str),
    /// OS error with errno.
    Os(i32),
}

impl NetError {
    /// The errno behind this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match *self {
            Self::QueueSetup(e) | Self::QueueSubmit(e) | Self::Socket(e) | Self::Os(e) => Some(e),
            _ => None,
        }
    }

    /// errno of the calling thread's last failed libc call.
    pub fn last_os() -> Self {
        Self::Os(last_errno())
    }
}

/// Read `errno` for the calling thread.
#[inline]
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueSetup(e) => write!(f, "completion queue setup: errno {}", e),
            Self::QueueSubmit(e) => write!(f, "completion queue submit: errno {}", e),
            Self::QueueFull => write!(f, "completion queue full"),
            Self::Socket(e) => write!(f, "socket setup: errno {}", e),
            Self::InvalidAddress(a) => write!(f, "invalid IPv4 address {:?}", a),
            Self::NotStarted => write!(f, "engine not started"),
            Self::NotFound(id) => write!(f, "connection {} not found", id),
            Self::Closed => write!(f, "connection closed"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {} bytes exceeds {} byte buffer", len, max)
            }
            Self::Unsupported(what) => write!(f, "unsupported: {}", what),
            Self::InvalidConfig(what) => write!(f, "invalid config: {}", what),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for NetError {}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        Self::Os(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_errno() {
        let e = NetError::Socket(libc::EADDRINUSE);
        assert_eq!(e.errno(), Some(libc::EADDRINUSE));
        assert!(e.to_string().contains("socket setup"));

        let e = NetError::PayloadTooLarge { len: 5000, max: 4096 };
        assert_eq!(e.errno(), None);
        assert_eq!(e.to_string(), "payload of 5000 bytes exceeds 4096 byte buffer");
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::from_raw_os_error(libc::ECONNREFUSED);
        match NetError::from(io) {
            NetError::Os(e) => assert_eq!(e, libc::ECONNREFUSED),
            other => panic!("unexpected {:?}", other),
        }
    }
}
