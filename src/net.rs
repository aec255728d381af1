use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{IntoRawFd, RawFd};

use crate::conn::Connection;
use crate::fd::FdConnection;
use crate::handler::Handle;

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                // `s_addr` is in network byte order, as are the octets.
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin };
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6 };
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn socket_addr_from_raw(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
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

/// A listening TCP socket.
///
/// Submit a [`wait_readable`](crate::ConnectionExt::wait_readable) to be
/// notified of pending connections, then call [`accept`](TcpListener::accept)
/// from the callback until it reports `WouldBlock`.
pub struct TcpListener {
    inner: FdConnection,
    local: SocketAddr,
}

impl TcpListener {
    pub fn bind(handler: &Handle, addr: SocketAddr) -> io::Result<TcpListener> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        Ok(TcpListener {
            inner: FdConnection::new(handler.clone(), listener.into_raw_fd(), false),
            local,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Accept one pending connection. Returns `WouldBlock` when the backlog
    /// is empty. The accepted socket is nonblocking and driven by the same
    /// reactor.
    pub fn accept(&self) -> io::Result<(TcpConnection, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.handle(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        let peer = socket_addr_from_raw(&storage)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        Ok((
            TcpConnection {
                inner: FdConnection::new(self.inner.io_handler().clone(), fd, false),
            },
            peer,
        ))
    }
}

impl Connection for TcpListener {
    fn handle(&self) -> RawFd {
        self.inner.handle()
    }

    fn io_handler(&self) -> &Handle {
        self.inner.io_handler()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn do_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.do_read(buf)
    }

    fn do_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.do_write(buf)
    }
}

/// A TCP stream.
pub struct TcpConnection {
    inner: FdConnection,
}

impl TcpConnection {
    /// Start a nonblocking connect.
    ///
    /// The connection attempt proceeds in the background; submit a
    /// [`wait_writable`](crate::ConnectionExt::wait_writable) and check
    /// [`take_error`](TcpConnection::take_error) in the callback to learn
    /// the outcome.
    pub fn connect(handler: &Handle, addr: SocketAddr) -> io::Result<TcpConnection> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = syscall!(socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        ))?;
        let (storage, len) = socket_addr_to_raw(&addr);
        match syscall!(connect(
            fd,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )) {
            Ok(_) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => {
                let _ = syscall!(close(fd));
                return Err(e);
            }
        }
        Ok(TcpConnection {
            inner: FdConnection::new(handler.clone(), fd, false),
        })
    }

    /// The pending socket error, if any; clears it. Used to check the
    /// outcome of a nonblocking connect.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.handle(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        ))?;
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(
            self.handle(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        socket_addr_from_raw(&storage).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))
    }
}

impl Connection for TcpConnection {
    fn handle(&self) -> RawFd {
        self.inner.handle()
    }

    fn io_handler(&self) -> &Handle {
        self.inner.io_handler()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn do_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.do_read(buf)
    }

    fn do_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.do_write(buf)
    }
}

/// A UDP socket.
///
/// Use [`read_from`](crate::ConnectionExt::read_from) /
/// [`write_to`](crate::ConnectionExt::write_to) for unconnected traffic; a
/// socket [`connect`](UdpConnection::connect)ed to a fixed peer also works
/// with the plain stream operations.
pub struct UdpConnection {
    inner: FdConnection,
    local: SocketAddr,
}

impl UdpConnection {
    pub fn bind(handler: &Handle, addr: SocketAddr) -> io::Result<UdpConnection> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        Ok(UdpConnection {
            inner: FdConnection::new(handler.clone(), socket.into_raw_fd(), false),
            local,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Set the default peer for `read`/`write`.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let (storage, len) = socket_addr_to_raw(&addr);
        syscall!(connect(
            self.handle(),
            &storage as *const _ as *const libc::sockaddr,
            len,
        ))
        .map(|_| ())
    }
}

impl Connection for UdpConnection {
    fn handle(&self) -> RawFd {
        self.inner.handle()
    }

    fn io_handler(&self) -> &Handle {
        self.inner.io_handler()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn do_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.do_read(buf)
    }

    fn do_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.do_write(buf)
    }

    fn do_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        let fd = self.handle();
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = syscall!(recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        Ok((n as usize, socket_addr_from_raw(&storage)))
    }

    fn do_send_to(&self, buf: &[u8], peer: &SocketAddr) -> io::Result<usize> {
        let fd = self.handle();
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let (storage, len) = socket_addr_to_raw(peer);
        syscall!(sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            &storage as *const _ as *const libc::sockaddr,
            len,
        ))
        .map(|n| n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_addr_survives_raw_conversion() {
        let addr: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let (storage, _) = socket_addr_to_raw(&addr);
        assert_eq!(socket_addr_from_raw(&storage), Some(addr));
    }

    #[test]
    fn unknown_family_is_rejected() {
        let storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        assert_eq!(socket_addr_from_raw(&storage), None);
    }
}
