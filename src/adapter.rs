use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::conn::Connection;
use crate::handler::Handle;

/// In-place byte transform applied by an [`Adapter`].
pub type Transform = Box<dyn Fn(&mut [u8]) + Send + Sync>;

/// A connection wrapping another connection, optionally transforming the
/// bytes that pass through it.
///
/// The adapter delegates the whole connection capability to the wrapped
/// connection; the reactor drives it like the inner connection itself.
/// Adapters stack: an adapter can wrap another adapter.
///
/// ```no_run
/// use std::sync::Arc;
/// use iomux::{Adapter, IoHandler};
///
/// # fn main() -> std::io::Result<()> {
/// let handler = IoHandler::new()?;
/// let (r, _w) = iomux::pipe(&handler.handle())?;
///
/// // Uppercase everything read through the adapter.
/// let upcase = Adapter::new(Arc::new(r))
///     .with_read_transform(|buf| buf.make_ascii_uppercase());
/// # let _ = upcase;
/// # Ok(())
/// # }
/// ```
pub struct Adapter {
    slave: Arc<dyn Connection>,
    rx: Option<Transform>,
    tx: Option<Transform>,
}

impl Adapter {
    pub fn new(slave: Arc<dyn Connection>) -> Adapter {
        Adapter {
            slave,
            rx: None,
            tx: None,
        }
    }

    /// Transform applied to drained bytes after every successful read.
    pub fn with_read_transform<F>(mut self, f: F) -> Adapter
    where
        F: Fn(&mut [u8]) + Send + Sync + 'static,
    {
        self.rx = Some(Box::new(f));
        self
    }

    /// Transform applied to outgoing bytes before every write.
    pub fn with_write_transform<F>(mut self, f: F) -> Adapter
    where
        F: Fn(&mut [u8]) + Send + Sync + 'static,
    {
        self.tx = Some(Box::new(f));
        self
    }

    /// The wrapped connection.
    pub fn conn(&self) -> &Arc<dyn Connection> {
        &self.slave
    }
}

impl Connection for Adapter {
    fn handle(&self) -> RawFd {
        self.slave.handle()
    }

    fn is_open(&self) -> bool {
        self.slave.is_open()
    }

    fn io_handler(&self) -> &Handle {
        self.slave.io_handler()
    }

    fn close(&self) {
        self.slave.close();
    }

    fn cancel(&self, read: bool, write: bool, fast: bool) {
        self.slave.cancel(read, write, fast);
    }

    fn do_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.slave.do_read(buf)?;
        if let Some(rx) = &self.rx {
            rx(&mut buf[..n]);
        }
        Ok(n)
    }

    fn do_write(&self, buf: &[u8]) -> io::Result<usize> {
        match &self.tx {
            Some(tx) => {
                // The caller's buffer is untouched; transform a scratch copy.
                let mut scratch = buf.to_vec();
                tx(&mut scratch);
                self.slave.do_write(&scratch)
            }
            None => self.slave.do_write(buf),
        }
    }

    fn do_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        let (n, peer) = self.slave.do_recv_from(buf)?;
        if let Some(rx) = &self.rx {
            rx(&mut buf[..n]);
        }
        Ok((n, peer))
    }

    fn do_send_to(&self, buf: &[u8], peer: &SocketAddr) -> io::Result<usize> {
        match &self.tx {
            Some(tx) => {
                let mut scratch = buf.to_vec();
                tx(&mut scratch);
                self.slave.do_send_to(&scratch, peer)
            }
            None => self.slave.do_send_to(buf, peer),
        }
    }
}
