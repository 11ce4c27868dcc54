//! TCP socket plumbing for the privileged data connections.
//!
//! These helpers are used by the broker in the two-process model and
//! directly by the sandboxed process in the one-process model, so they
//! stick to plain blocking syscalls plus `poll(2)` for the timeouts.

use crate::{error::Error, net::Fd};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
    sys::socket::{
        self, getpeername, getsockname, getsockopt, setsockopt, sockopt, AddressFamily, InetAddr,
        SockAddr, SockFlag, SockType,
    },
};
use std::{
    convert::TryFrom,
    mem,
    net::{IpAddr, SocketAddr},
    os::unix::io::AsRawFd,
    slice,
    time::Duration,
};

/// Address family of a socket address, as passed to `socket(2)`.
pub fn family(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

/// Create a new blocking TCP socket in the family of `addr`.
pub fn tcp_socket(addr: &SocketAddr) -> Result<Fd, Error> {
    socket::socket(
        family(addr),
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map(Fd::from)
    .map_err(Into::into)
}

pub fn set_reuseaddr(fd: &Fd) -> Result<(), Error> {
    setsockopt(fd.as_raw_fd(), sockopt::ReuseAddr, &true).map_err(Into::into)
}

pub fn bind(fd: &Fd, addr: &SocketAddr) -> Result<(), Error> {
    socket::bind(fd.as_raw_fd(), &SockAddr::new_inet(InetAddr::from_std(addr)))
        .map_err(Into::into)
}

pub fn listen(fd: &Fd, backlog: usize) -> Result<(), Error> {
    socket::listen(fd.as_raw_fd(), backlog).map_err(Into::into)
}

/// Wait until `fd` is ready for `events`, or fail with `Error::Timeout`.
fn wait_for(fd: &Fd, events: PollFlags, timeout: Duration) -> Result<(), Error> {
    let timeout = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    let mut fds = [PollFd::new(fd.as_raw_fd(), events)];
    loop {
        match poll(&mut fds, timeout) {
            Ok(0) => return Err(Error::Timeout),
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Connect `fd` to `addr`, giving up after `timeout`.
///
/// A zero timeout performs a plain blocking connect.
pub fn connect_timeout(fd: &Fd, addr: &SocketAddr, timeout: Duration) -> Result<(), Error> {
    let sockaddr = SockAddr::new_inet(InetAddr::from_std(addr));

    if timeout == Duration::from_secs(0) {
        return socket::connect(fd.as_raw_fd(), &sockaddr).map_err(Into::into);
    }

    fd.set_nonblocking(true)?;
    let result = match socket::connect(fd.as_raw_fd(), &sockaddr) {
        Ok(()) => Ok(()),
        Err(Errno::EINPROGRESS) => wait_for(fd, PollFlags::POLLOUT, timeout).and_then(|_| {
            match getsockopt(fd.as_raw_fd(), sockopt::SocketError)? {
                0 => Ok(()),
                err => Err(Errno::from_i32(err).into()),
            }
        }),
        Err(err) => Err(err.into()),
    };
    fd.set_nonblocking(false)?;

    result
}

/// Accept one connection on the listening socket `fd` within `timeout`.
pub fn accept_timeout(fd: &Fd, timeout: Duration) -> Result<(Fd, SocketAddr), Error> {
    if timeout > Duration::from_secs(0) {
        wait_for(fd, PollFlags::POLLIN, timeout)?;
    }
    let remote = socket::accept4(fd.as_raw_fd(), SockFlag::SOCK_CLOEXEC).map(Fd::from)?;
    let addr = peer_addr(&remote)?;
    Ok((remote, addr))
}

fn to_std(addr: SockAddr) -> Result<SocketAddr, Error> {
    match addr {
        SockAddr::Inet(inet) => Ok(inet.to_std()),
        _ => Err(Errno::EAFNOSUPPORT.into()),
    }
}

pub fn peer_addr(fd: &Fd) -> Result<SocketAddr, Error> {
    getpeername(fd.as_raw_fd())
        .map_err(Error::from)
        .and_then(to_std)
}

pub fn local_addr(fd: &Fd) -> Result<SocketAddr, Error> {
    getsockname(fd.as_raw_fd())
        .map_err(Error::from)
        .and_then(to_std)
}

/// Size of the `struct sockaddr_in{,6}` that describes `addr`.
pub fn sockaddr_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => mem::size_of::<libc::sockaddr_in>(),
        SocketAddr::V6(_) => mem::size_of::<libc::sockaddr_in6>(),
    }
}

/// Encode `addr` exactly as the kernel expects it in memory.
pub fn encode_sockaddr(addr: &SocketAddr) -> Vec<u8> {
    let addr = SockAddr::new_inet(InetAddr::from_std(addr));
    unsafe {
        let (sockaddr, len) = addr.as_ffi_pair();
        slice::from_raw_parts(sockaddr as *const libc::sockaddr as *const u8, len as usize)
            .to_vec()
    }
}

/// Read-only view of a raw `struct sockaddr` copied from another process.
#[derive(Debug)]
pub struct RawSockAddr<'a>(&'a [u8]);

impl<'a> RawSockAddr<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self(bytes)
    }

    /// The `sa_family` field in host byte order.
    pub fn family(&self) -> Option<libc::c_int> {
        let bytes = self.0.get(..2)?;
        Some(libc::sa_family_t::from_ne_bytes([bytes[0], bytes[1]]) as libc::c_int)
    }

    /// The port in host byte order.
    pub fn port(&self) -> Option<u16> {
        let bytes = self.0.get(2..4)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// The raw address bytes, 4 for IPv4 and 16 for IPv6.
    pub fn ip_octets(&self) -> Option<&'a [u8]> {
        match self.family()? {
            libc::AF_INET => self.0.get(4..8),
            libc::AF_INET6 => self.0.get(8..24),
            _ => None,
        }
    }

    /// Compare the address part, byte for byte, with a known address.
    pub fn same_ip(&self, ip: &IpAddr) -> bool {
        match (self.ip_octets(), ip) {
            (Some(octets), IpAddr::V4(ip)) => octets == &ip.octets()[..],
            (Some(octets), IpAddr::V6(ip)) => octets == &ip.octets()[..],
            (None, _) => false,
        }
    }
}
