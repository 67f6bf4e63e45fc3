//! Thin wrappers over the raw socket syscalls used by the reactor.
//!
//! `EINTR` is retried inside every wrapper, so callers only ever see
//! `WouldBlock` or a real failure.

use crate::error::SocketError;
use crate::socket::slot::Protocol;
use core::mem;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];

    // SAFETY: `fds` is a valid out-array for two descriptors.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: both descriptors were just created and are owned here.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a plain descriptor with no out-parameters.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    // SAFETY: `value` outlives the call and its size is passed alongside.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if rc == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

pub(crate) fn set_keepalive(fd: RawFd) {
    let _ = setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1);
}

pub(crate) fn set_nodelay(fd: RawFd) {
    let _ = setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
}

/// Read and clear the pending error on a connecting socket.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

    // SAFETY: `err` and `len` are valid out-pointers.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };

    if rc == -1 {
        return Err(io::Error::last_os_error());
    }

    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }

    Ok(())
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // SAFETY: `buf` is valid for `len` writable bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };

        if n >= 0 {
            return Ok(n as usize);
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        // SAFETY: `buf` is valid for `len` readable bytes.
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };

        if n >= 0 {
            return Ok(n as usize);
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub(crate) fn close(fd: RawFd) {
    // SAFETY: the caller owns the descriptor and does not reuse it.
    let rc = unsafe { libc::close(fd) };
    if rc == -1 {
        log::error!("close socket fd {}: {}", fd, io::Error::last_os_error());
    }
}

/// Resolve `host:port`, treating an empty host as the wildcard address.
pub(crate) fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, SocketError> {
    let host = if host.is_empty() { "0.0.0.0" } else { host };

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| SocketError::Resolve(e.to_string()))?
        .collect();

    if addrs.is_empty() {
        return Err(SocketError::Resolve(format!("no addresses for {}", host)));
    }

    Ok(addrs)
}

fn socket(family: libc::c_int, kind: libc::c_int) -> io::Result<RawFd> {
    // SAFETY: plain descriptor creation.
    let fd = unsafe { libc::socket(family, kind, 0) };

    if fd == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

fn family_of(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

/// Create a bound, listening, non-blocking TCP socket.
pub(crate) fn tcp_listen(host: &str, port: u16, backlog: i32) -> Result<RawFd, SocketError> {
    let addrs = resolve(host, port)?;
    let mut last_err: Option<io::Error> = None;

    for addr in addrs {
        match try_listen(addr, backlog) {
            Ok(fd) => return Ok(fd),
            Err(e) => last_err = Some(e),
        }
    }

    Err(SocketError::Create(
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no usable address".to_owned()),
    ))
}

fn try_listen(addr: SocketAddr, backlog: i32) -> io::Result<RawFd> {
    let fd = socket(family_of(&addr), libc::SOCK_STREAM)?;

    let setup = || -> io::Result<()> {
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;

        let (storage, len) = sockaddr_from(&addr);
        // SAFETY: `storage` holds a valid address of length `len`.
        if unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) } == -1 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: fd is a bound stream socket.
        if unsafe { libc::listen(fd, backlog as libc::c_int) } == -1 {
            return Err(io::Error::last_os_error());
        }

        set_nonblocking(fd)
    };

    match setup() {
        Ok(()) => Ok(fd),
        Err(e) => {
            close(fd);

            Err(e)
        }
    }
}

/// Start a non-blocking connect. Returns the descriptor and whether the
/// connection completed synchronously.
pub(crate) fn tcp_connect_begin(addr: SocketAddr) -> io::Result<(RawFd, bool)> {
    let fd = socket(family_of(&addr), libc::SOCK_STREAM)?;

    set_keepalive(fd);

    if let Err(e) = set_nonblocking(fd) {
        close(fd);

        return Err(e);
    }

    let (storage, len) = sockaddr_from(&addr);
    // SAFETY: `storage` holds a valid address of length `len`.
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };

    if rc == 0 {
        return Ok((fd, true));
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return Ok((fd, false));
    }

    close(fd);

    Err(err)
}

/// Create a non-blocking UDP socket, bound when a local address is given.
pub(crate) fn udp_socket(local: Option<SocketAddr>) -> io::Result<(RawFd, Protocol)> {
    let (family, protocol) = match local {
        Some(SocketAddr::V6(_)) => (libc::AF_INET6, Protocol::Udp6),
        _ => (libc::AF_INET, Protocol::Udp),
    };

    let fd = socket(family, libc::SOCK_DGRAM)?;

    let setup = || -> io::Result<()> {
        if let Some(addr) = local {
            setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;

            let (storage, len) = sockaddr_from(&addr);
            // SAFETY: `storage` holds a valid address of length `len`.
            if unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) } == -1 {
                return Err(io::Error::last_os_error());
            }
        }

        set_nonblocking(fd)
    };

    match setup() {
        Ok(()) => Ok((fd, protocol)),
        Err(e) => {
            close(fd);

            Err(e)
        }
    }
}

pub(crate) fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    loop {
        // SAFETY: zeroed sockaddr_storage is a valid out-buffer.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        // SAFETY: `storage` and `len` are valid out-pointers.
        let client =
            unsafe { libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };

        if client >= 0 {
            let peer = sockaddr_into(&storage).unwrap_or(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                0,
            ));

            return Ok((client, peer));
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    // SAFETY: zeroed sockaddr_storage is a valid out-buffer.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    // SAFETY: `storage` and `len` are valid out-pointers.
    let rc = unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }

    sockaddr_into(&storage).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    // SAFETY: zeroed sockaddr_storage is a valid out-buffer.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    // SAFETY: `storage` and `len` are valid out-pointers.
    let rc = unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }

    sockaddr_into(&storage).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], to: &SocketAddr) -> io::Result<usize> {
    let (storage, len) = sockaddr_from(to);

    loop {
        // SAFETY: `buf` and `storage` are valid for the lengths passed.
        let n = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };

        if n >= 0 {
            return Ok(n as usize);
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    loop {
        // SAFETY: zeroed sockaddr_storage is a valid out-buffer.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        // SAFETY: `buf`, `storage` and `len` are valid out-pointers.
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };

        if n >= 0 {
            let from = sockaddr_into(&storage).unwrap_or(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                0,
            ));

            return Ok((n as usize, from));
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: a zeroed sockaddr_storage is a valid empty address.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: sockaddr_storage is large enough for sockaddr_in.
            unsafe {
                let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                // Octets are already network order; keep the bytes as-is.
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }

            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            // SAFETY: sockaddr_storage is large enough for sockaddr_in6.
            unsafe {
                let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_scope_id = v6.scope_id();
            }

            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_into(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: the family field says this is a sockaddr_in.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };

            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: the family field says this is a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };

            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.168.1.20:9001".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);

        assert_eq!(sockaddr_into(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::7]:53".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);

        assert_eq!(sockaddr_into(&storage), Some(addr));
    }

    #[test]
    fn listener_binds_ephemeral_port() {
        let fd = tcp_listen("127.0.0.1", 0, 32).unwrap();
        let bound = local_addr(fd).unwrap();

        assert!(bound.port() != 0);

        close(fd);
    }
}
