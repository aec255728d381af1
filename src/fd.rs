use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::conn::Connection;
use crate::handler::Handle;

/// A connection over an arbitrary open file descriptor.
///
/// This is the building block the more specific connection types delegate
/// to, and a generic wrapper for descriptors opened by other means. The
/// descriptor should be in nonblocking mode; see [`set_nonblocking`].
pub struct FdConnection {
    fd: AtomicI32,
    handler: Handle,
    keep_open: bool,
}

impl FdConnection {
    /// Wrap an already-open descriptor. With `keep_open` the descriptor is
    /// not closed when the connection is dropped.
    pub fn new(handler: Handle, fd: RawFd, keep_open: bool) -> FdConnection {
        FdConnection {
            fd: AtomicI32::new(fd),
            handler,
            keep_open,
        }
    }
}

impl Connection for FdConnection {
    fn handle(&self) -> RawFd {
        self.fd.load(Ordering::SeqCst)
    }

    fn io_handler(&self) -> &Handle {
        &self.handler
    }

    fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            // From a callback the reactor thread cannot wait on itself, so
            // the cancellation is only scheduled there.
            self.handler
                .cancel_fd(fd, true, true, self.handler.same_thread());
            let _ = syscall!(close(fd));
        }
    }

    fn do_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.handle();
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())).map(|n| n as usize)
    }

    fn do_write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.handle();
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
    }
}

impl Drop for FdConnection {
    fn drop(&mut self) {
        if !self.keep_open {
            self.close();
        }
    }
}

/// Create a nonblocking pipe pair `(read end, write end)`.
pub fn pipe(handler: &Handle) -> io::Result<(FdConnection, FdConnection)> {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
    Ok((
        FdConnection::new(handler.clone(), fds[0], false),
        FdConnection::new(handler.clone(), fds[1], false),
    ))
}

/// Put a descriptor into nonblocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map(|_| ())
}
