use std::fs::OpenOptions;
use std::io;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::conn::Connection;
use crate::fd::FdConnection;
use crate::handler::Handle;

/// A connection over a regular file.
///
/// Plain files are rejected by the readiness backend and serviced through
/// the reactor's always-ready path: queued reads and writes complete on the
/// next loop iteration, in submission order like any other connection.
pub struct FileConnection {
    inner: FdConnection,
}

impl FileConnection {
    /// Open a file for reading.
    pub fn open<P: AsRef<Path>>(handler: &Handle, path: P) -> io::Result<FileConnection> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        FileConnection::from_options(handler, &opts, path)
    }

    /// Create (or truncate) a file for writing.
    pub fn create<P: AsRef<Path>>(handler: &Handle, path: P) -> io::Result<FileConnection> {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        FileConnection::from_options(handler, &opts, path)
    }

    /// Open with caller-supplied options.
    pub fn from_options<P: AsRef<Path>>(
        handler: &Handle,
        opts: &OpenOptions,
        path: P,
    ) -> io::Result<FileConnection> {
        let mut opts = opts.clone();
        opts.custom_flags(libc::O_NONBLOCK);
        let file = opts.open(path)?;
        Ok(FileConnection {
            inner: FdConnection::new(handler.clone(), file.into_raw_fd(), false),
        })
    }
}

impl Connection for FileConnection {
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
