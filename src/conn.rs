use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::handler::Handle;
use crate::ops::{Direction, Peer};

/// Result of a completed, timed-out or cancelled operation, handed to the
/// completion callback on the reactor thread.
///
/// The buffer submitted with the operation is moved back out through `buf`;
/// the reactor reads and writes it in place and never touches it again after
/// the callback has run.
pub struct IoResult {
    /// The buffer the operation read into or wrote from.
    pub buf: Vec<u8>,
    /// The requested number of bytes.
    pub size: usize,
    /// Bytes transferred, or the error that ended the operation. `Ok(0)` on
    /// a read means end-of-stream (and is the success value of readiness
    /// waits); a timed-out operation carries `ETIMEDOUT`, a cancelled one
    /// `ECANCELED`.
    pub result: io::Result<usize>,
    /// Datagram peer: the sender for `read_from`, the destination echoed
    /// back for `write_to`.
    pub peer: Option<SocketAddr>,
    /// The timeout the operation was submitted with.
    pub timeout: Option<Duration>,
}

impl IoResult {
    /// The transferred bytes of a successful read.
    pub fn data(&self) -> &[u8] {
        match self.result {
            Ok(n) => &self.buf[..n],
            Err(_) => &[],
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(&self.result, Err(e) if e.raw_os_error() == Some(libc::ETIMEDOUT))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(&self.result, Err(e) if e.raw_os_error() == Some(libc::ECANCELED))
    }
}

/// Completion callback. Runs on the reactor thread; the returned bool tells
/// the reactor whether to keep draining this connection's queue before
/// returning to the readiness wait.
pub type IoCallback = Box<dyn FnOnce(IoResult) -> bool + Send>;

/// The capability a byte-stream or datagram endpoint must expose to be
/// driven by an [`IoHandler`](crate::IoHandler).
///
/// The `do_*` primitives must behave as nonblocking syscalls: return
/// `ErrorKind::WouldBlock` when no progress is possible, `Ok(0)` on
/// end-of-stream, and the transferred count otherwise. The reactor relies on
/// exactly that contract to decide between re-arming readiness and advancing
/// the queue.
///
/// Adapters implement the same capability by delegating to a wrapped inner
/// connection, optionally transforming the bytes; see
/// [`Adapter`](crate::Adapter). A TLS endpoint fits the same mold: it keeps
/// its handshake state internal and surfaces plain nonblocking byte
/// semantics here.
pub trait Connection: Send + Sync {
    /// The underlying descriptor, or -1 once closed.
    fn handle(&self) -> RawFd;

    fn is_open(&self) -> bool {
        self.handle() >= 0
    }

    /// The reactor handle driving this connection.
    fn io_handler(&self) -> &Handle;

    /// Cancel pending operations and close the descriptor.
    fn close(&self);

    /// Cancel pending read and/or write operations; forwards to the reactor.
    fn cancel(&self, read: bool, write: bool, fast: bool) {
        self.io_handler().cancel_fd(self.handle(), read, write, fast);
    }

    /// Read up to `buf.len()` bytes without blocking.
    fn do_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes without blocking.
    fn do_write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Datagram read reporting the sender. Stream endpoints fall back to
    /// `do_read` with no peer.
    fn do_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        self.do_read(buf).map(|n| (n, None))
    }

    /// Datagram write to an explicit destination.
    fn do_send_to(&self, _buf: &[u8], _peer: &SocketAddr) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP))
    }
}

/// Asynchronous submission methods, available on any `Arc`-held connection.
///
/// Operations keep the connection alive through a cloned `Arc` until their
/// callback has run, so a connection dropped by the application with
/// operations still queued is destroyed only after the last one completes.
///
/// On a submission error the moved-in buffer and callback are dropped; the
/// error is reported synchronously and no callback fires.
pub trait ConnectionExt {
    /// Read up to `buf.len()` bytes; the callback receives the buffer back
    /// with the transferred count.
    fn read<F>(&self, buf: Vec<u8>, cb: F, timeout: Option<Duration>) -> io::Result<()>
    where
        F: FnOnce(IoResult) -> bool + Send + 'static;

    /// Write the contents of `buf`. A single `write(2)` transferring fewer
    /// than `buf.len()` bytes completes the operation with that count.
    fn write<F>(&self, buf: Vec<u8>, cb: F, timeout: Option<Duration>) -> io::Result<()>
    where
        F: FnOnce(IoResult) -> bool + Send + 'static;

    /// Wait until the descriptor is readable without transferring bytes.
    /// The callback fires with `Ok(0)`.
    fn wait_readable<F>(&self, cb: F, timeout: Option<Duration>) -> io::Result<()>
    where
        F: FnOnce(IoResult) -> bool + Send + 'static;

    /// Wait until the descriptor is writable without transferring bytes.
    fn wait_writable<F>(&self, cb: F, timeout: Option<Duration>) -> io::Result<()>
    where
        F: FnOnce(IoResult) -> bool + Send + 'static;

    /// Datagram read; the sender address is delivered in `IoResult::peer`.
    fn read_from<F>(&self, buf: Vec<u8>, cb: F, timeout: Option<Duration>) -> io::Result<()>
    where
        F: FnOnce(IoResult) -> bool + Send + 'static;

    /// Datagram write to `peer`.
    fn write_to<F>(
        &self,
        buf: Vec<u8>,
        peer: SocketAddr,
        cb: F,
        timeout: Option<Duration>,
    ) -> io::Result<()>
    where
        F: FnOnce(IoResult) -> bool + Send + 'static;

    /// Submit a read and block the calling thread until it completes.
    /// Fails with `EDEADLK` on the reactor thread, which must never block
    /// on its own completions.
    fn read_blocking(&self, buf: Vec<u8>, timeout: Option<Duration>) -> io::Result<IoResult>;

    /// Submit a write and block the calling thread until it completes.
    fn write_blocking(&self, buf: Vec<u8>, timeout: Option<Duration>) -> io::Result<IoResult>;
}

impl<C: Connection + 'static> ConnectionExt for Arc<C> {
    fn read<F>(&self, buf: Vec<u8>, cb: F, timeout: Option<Duration>) -> io::Result<()>
    where
        F: FnOnce(IoResult) -> bool + Send + 'static,
    {
        let size = buf.len();
        self.io_handler().submit(
            Direction::Read,
            Arc::clone(self) as Arc<dyn Connection>,
            buf,
            size,
            false,
            Peer::None,
            Box::new(cb),
            timeout,
        )
    }

    fn write<F>(&self, buf: Vec<u8>, cb: F, timeout: Option<Duration>) -> io::Result<()>
    where
        F: FnOnce(IoResult) -> bool + Send + 'static,
    {
        let size = buf.len();
        self.io_handler().submit(
            Direction::Write,
            Arc::clone(self) as Arc<dyn Connection>,
            buf,
            size,
            false,
            Peer::None,
            Box::new(cb),
            timeout,
        )
    }

    fn wait_readable<F>(&self, cb: F, timeout: Option<Duration>) -> io::Result<()>
    where
        F: FnOnce(IoResult) -> bool + Send + 'static,
    {
        self.io_handler().submit(
            Direction::Read,
            Arc::clone(self) as Arc<dyn Connection>,
            Vec::new(),
            0,
            true,
            Peer::None,
            Box::new(cb),
            timeout,
        )
    }

    fn wait_writable<F>(&self, cb: F, timeout: Option<Duration>) -> io::Result<()>
    where
        F: FnOnce(IoResult) -> bool + Send + 'static,
    {
        self.io_handler().submit(
            Direction::Write,
            Arc::clone(self) as Arc<dyn Connection>,
            Vec::new(),
            0,
            true,
            Peer::None,
            Box::new(cb),
            timeout,
        )
    }

    fn read_from<F>(&self, buf: Vec<u8>, cb: F, timeout: Option<Duration>) -> io::Result<()>
    where
        F: FnOnce(IoResult) -> bool + Send + 'static,
    {
        let size = buf.len();
        self.io_handler().submit(
            Direction::Read,
            Arc::clone(self) as Arc<dyn Connection>,
            buf,
            size,
            false,
            Peer::Recv,
            Box::new(cb),
            timeout,
        )
    }

    fn write_to<F>(
        &self,
        buf: Vec<u8>,
        peer: SocketAddr,
        cb: F,
        timeout: Option<Duration>,
    ) -> io::Result<()>
    where
        F: FnOnce(IoResult) -> bool + Send + 'static,
    {
        let size = buf.len();
        self.io_handler().submit(
            Direction::Write,
            Arc::clone(self) as Arc<dyn Connection>,
            buf,
            size,
            false,
            Peer::Send(peer),
            Box::new(cb),
            timeout,
        )
    }

    fn read_blocking(&self, buf: Vec<u8>, timeout: Option<Duration>) -> io::Result<IoResult> {
        if self.io_handler().same_thread() {
            return Err(io::Error::from_raw_os_error(libc::EDEADLK));
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.read(
            buf,
            move |ior| {
                let _ = tx.send(ior);
                false
            },
            timeout,
        )?;
        rx.recv()
            .map_err(|_| io::Error::from_raw_os_error(libc::ECANCELED))
    }

    fn write_blocking(&self, buf: Vec<u8>, timeout: Option<Duration>) -> io::Result<IoResult> {
        if self.io_handler().same_thread() {
            return Err(io::Error::from_raw_os_error(libc::EDEADLK));
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.write(
            buf,
            move |ior| {
                let _ = tx.send(ior);
                false
            },
            timeout,
        )?;
        rx.recv()
            .map_err(|_| io::Error::from_raw_os_error(libc::ECANCELED))
    }
}
