//! Completion queue backend selection.

use crate::epoll_queue::EpollQueue;
use crate::uring_queue::{UringQueue, UringQueueConfig};

use cqnet_core::completion::CompletionQueue;
use cqnet_core::error::Result;
use cqnet_core::{kinfo, kwarn};

use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// io_uring if the kernel allows it, epoll otherwise.
    #[default]
    Auto,
    Uring,
    Epoll,
}

impl FromStr for Backend {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "uring" | "io_uring" | "iouring" => Ok(Self::Uring),
            "epoll" => Ok(Self::Epoll),
            _ => Err(()),
        }
    }
}

/// Open one completion queue of the requested kind.
pub fn open_queue(backend: Backend, ring_entries: u32) -> Result<Arc<dyn CompletionQueue>> {
    let uring = || UringQueue::new(UringQueueConfig { entries: ring_entries });
    let queue: Arc<dyn CompletionQueue> = match backend {
        Backend::Uring => Arc::new(uring()?),
        Backend::Epoll => Arc::new(EpollQueue::new()?),
        Backend::Auto => match uring() {
            Ok(q) => Arc::new(q),
            Err(e) => {
                kwarn!("io_uring unavailable ({}), falling back to epoll", e);
                Arc::new(EpollQueue::new()?)
            }
        },
    };
    kinfo!("completion queue: {}", queue.name());
    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("EPOLL".parse::<Backend>(), Ok(Backend::Epoll));
        assert_eq!("io_uring".parse::<Backend>(), Ok(Backend::Uring));
        assert_eq!(" auto ".parse::<Backend>(), Ok(Backend::Auto));
        assert!("kqueue".parse::<Backend>().is_err());
    }

    #[test]
    fn test_auto_always_opens() {
        let q = open_queue(Backend::Auto, 64).unwrap();
        assert!(q.name() == "io_uring" || q.name() == "epoll");
        assert_eq!(open_queue(Backend::Epoll, 64).unwrap().name(), "epoll");
    }
}
