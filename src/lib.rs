//! Callback-driven non-blocking I/O multiplexing.
//!
//! An [`IoHandler`] multiplexes any number of connections over one reactor
//! thread. Applications submit per-operation read and write requests with a
//! completion callback; the reactor waits for kernel readiness, performs the
//! transfer into the submitted buffer and invokes the callback. Operations
//! carry optional timeouts and can be cancelled, individually per direction
//! or wholesale by closing the connection.
//!
//! Everything the reactor drives implements the small [`Connection`]
//! capability; [`FdConnection`] covers arbitrary descriptors and the crate
//! ships wrappers for files, sockets, timers and file-change notifications.
//! Submission itself lives in [`ConnectionExt`] and is available on any
//! `Arc`-held connection.
//!
//! # Guarantees
//!
//! * Per connection and direction, operations complete in submission order.
//! * Callbacks run on the reactor thread, and each runs at most once.
//! * A non-`fast` cancel from another thread returns only once no callback
//!   of the cancelled operations can fire anymore.
//! * Buffers travel with their operation: moved in at submission, moved
//!   back out through the callback's [`IoResult`], and untouched afterwards.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use iomux::{ConnectionExt, IoHandler};
//!
//! # fn main() -> std::io::Result<()> {
//! let handler = IoHandler::new()?;
//! handler.run(true)?;
//!
//! let (r, w) = iomux::pipe(&handler.handle())?;
//! let (r, w) = (Arc::new(r), Arc::new(w));
//!
//! w.write(
//!     b"ping".to_vec(),
//!     |ior| {
//!         assert_eq!(ior.result.unwrap(), 4);
//!         false
//!     },
//!     None,
//! )?;
//!
//! let reply = r.read_blocking(vec![0u8; 16], None)?;
//! assert_eq!(reply.data(), b"ping");
//!
//! handler.stop();
//! handler.join();
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod sys;

mod adapter;
mod conn;
mod fd;
mod file;
mod handler;
mod interest;
mod net;
pub mod notify;
mod ops;
mod timer;

pub use adapter::{Adapter, Transform};
pub use conn::{Connection, ConnectionExt, IoCallback, IoResult};
pub use fd::{pipe, set_nonblocking, FdConnection};
pub use file::FileConnection;
pub use handler::{Handle, IoHandler};
pub use net::{TcpConnection, TcpListener, UdpConnection};
pub use notify::{FileNotifier, NotifyEvent};
pub use timer::{TimerConnection, TimerSet};
