//! Raw socket helpers over libc.
//!
//! Sockets are created blocking; backends that need `O_NONBLOCK` set it
//! themselves in `CompletionQueue::bind`. Every returned descriptor is an
//! `OwnedFd`, so an early `?` closes it.

use cqnet_core::addr;
use cqnet_core::error::{last_errno, NetError, Result};

use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

const CONNECT_TIMEOUT_MS: i32 = 5_000;

fn new_socket(ty: i32) -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, ty | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(NetError::Socket(last_errno()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_opt(fd: RawFd, level: i32, name: i32, value: i32) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(NetError::Socket(last_errno()));
    }
    Ok(())
}

fn bind_to(fd: RawFd, at: SocketAddrV4) -> Result<()> {
    let sa = addr::to_sockaddr(at);
    let ret = unsafe {
        libc::bind(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            addr::sockaddr_len(),
        )
    };
    if ret != 0 {
        return Err(NetError::Socket(last_errno()));
    }
    Ok(())
}

/// Create, bind and listen a TCP socket.
pub fn tcp_listener(at: SocketAddrV4, backlog: i32) -> Result<OwnedFd> {
    let sock = new_socket(libc::SOCK_STREAM)?;
    let fd = sock.as_raw_fd();
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    bind_to(fd, at)?;
    if unsafe { libc::listen(fd, backlog) } != 0 {
        return Err(NetError::Socket(last_errno()));
    }
    Ok(sock)
}

/// Connect a TCP socket to `to`.
///
/// An interrupted or in-progress connect is completed by waiting for
/// writability and reading `SO_ERROR`.
pub fn tcp_connect(to: SocketAddrV4) -> Result<OwnedFd> {
    let sock = new_socket(libc::SOCK_STREAM)?;
    let fd = sock.as_raw_fd();
    let sa = addr::to_sockaddr(to);
    let ret = unsafe {
        libc::connect(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            addr::sockaddr_len(),
        )
    };
    if ret != 0 {
        match last_errno() {
            libc::EINPROGRESS | libc::EINTR | libc::EALREADY => finish_connect(fd)?,
            e => return Err(NetError::Socket(e)),
        }
    }
    let _ = set_nodelay(fd);
    Ok(sock)
}

fn finish_connect(fd: RawFd) -> Result<()> {
    if !poll_one(fd, libc::POLLOUT, CONNECT_TIMEOUT_MS) {
        return Err(NetError::Socket(libc::ETIMEDOUT));
    }
    let mut err: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(NetError::Socket(last_errno()));
    }
    if err != 0 {
        return Err(NetError::Socket(err));
    }
    Ok(())
}

/// Create and bind a UDP socket. Port 0 picks an ephemeral port.
pub fn udp_socket(at: SocketAddrV4) -> Result<OwnedFd> {
    let sock = new_socket(libc::SOCK_DGRAM)?;
    let fd = sock.as_raw_fd();
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    bind_to(fd, at)?;
    Ok(sock)
}

pub fn set_nodelay(fd: RawFd) -> Result<()> {
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(NetError::last_os());
    }
    if flags & libc::O_NONBLOCK == 0
        && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
    {
        return Err(NetError::last_os());
    }
    Ok(())
}

pub fn local_addr(fd: RawFd) -> Result<SocketAddrV4> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = addr::sockaddr_len();
    let ret = unsafe {
        libc::getsockname(fd, &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr, &mut len)
    };
    if ret != 0 {
        return Err(NetError::last_os());
    }
    Ok(addr::from_sockaddr(&sa))
}

pub fn peer_addr(fd: RawFd) -> Result<SocketAddrV4> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = addr::sockaddr_len();
    let ret = unsafe {
        libc::getpeername(fd, &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr, &mut len)
    };
    if ret != 0 {
        return Err(NetError::last_os());
    }
    Ok(addr::from_sockaddr(&sa))
}

/// Wake every operation pending on `fd`. Errors (e.g. ENOTCONN) are
/// expected for sockets that never connected.
pub fn shutdown(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

/// Zero-length non-blocking send. `Err(errno)` means the peer is gone.
pub fn probe_alive(fd: RawFd) -> std::result::Result<(), i32> {
    let ret = unsafe {
        libc::send(fd, std::ptr::null(), 0, libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT)
    };
    if ret < 0 {
        match last_errno() {
            libc::EAGAIN | libc::EINTR => Ok(()),
            e => Err(e),
        }
    } else {
        Ok(())
    }
}

/// True when `fd` reports `events` within `timeout_ms`.
pub fn poll_one(fd: RawFd, events: i16, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 && last_errno() == libc::EINTR {
            continue;
        }
        return ret > 0;
    }
}

/// Errors on a per-operation completion meaning the peer is gone.
pub fn is_disconnect(errno: i32) -> bool {
    matches!(
        errno,
        libc::ECONNRESET
            | libc::ECONNABORTED
            | libc::EPIPE
            | libc::ENOTCONN
            | libc::ESHUTDOWN
            | libc::ETIMEDOUT
            | libc::EHOSTUNREACH
            | libc::ENETUNREACH
            | libc::ENETRESET
            | libc::ECANCELED
            | libc::EBADF
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_listener_ephemeral_port() {
        let l = tcp_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 16).unwrap();
        let at = local_addr(l.as_raw_fd()).unwrap();
        assert_eq!(*at.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(at.port(), 0);
    }

    #[test]
    fn test_connect_and_addresses() {
        let l = tcp_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 16).unwrap();
        let at = local_addr(l.as_raw_fd()).unwrap();
        let c = tcp_connect(at).unwrap();
        assert_eq!(peer_addr(c.as_raw_fd()).unwrap(), at);
        assert!(probe_alive(c.as_raw_fd()).is_ok());
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to find a port nobody listens on.
        let port = {
            let u = tcp_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 1).unwrap();
            local_addr(u.as_raw_fd()).unwrap().port()
        };
        match tcp_connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)) {
            Err(NetError::Socket(e)) => assert_eq!(e, libc::ECONNREFUSED),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_udp_bind_and_nonblocking() {
        let u = udp_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        assert_ne!(local_addr(u.as_raw_fd()).unwrap().port(), 0);
        set_nonblocking(u.as_raw_fd()).unwrap();
        let flags = unsafe { libc::fcntl(u.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(is_disconnect(libc::ECONNRESET));
        assert!(is_disconnect(libc::EPIPE));
        assert!(!is_disconnect(libc::EAGAIN));
        assert!(!is_disconnect(libc::EMFILE));
    }
}
