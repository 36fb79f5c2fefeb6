//! Connection identifiers.

use std::fmt;
use std::os::unix::io::RawFd;

/// Identifier of one connection for its whole active lifetime.
///
/// Low 32 bits hold the socket descriptor, high 32 bits a generation drawn
/// from the owning pool's counter. A descriptor number the kernel hands out
/// again after `close()` therefore never produces an id equal to one that
/// was used before, and late completions for the old connection miss the
/// active map instead of landing on the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ConnId(pub u64);

impl ConnId {
    pub const NONE: Self = Self(u64::MAX);

    #[inline]
    pub fn new(fd: RawFd, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (fd as u32 as u64))
    }

    #[inline]
    pub fn fd(self) -> RawFd {
        self.0 as u32 as RawFd
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else {
            write!(f, "{}#{}", self.fd(), self.generation())
        }
    }
}
