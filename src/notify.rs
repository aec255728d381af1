use std::collections::HashMap;
use std::ffi::{CString, OsString};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use log::warn;

use crate::conn::{Connection, ConnectionExt, IoResult};
use crate::fd::FdConnection;
use crate::handler::Handle;

/// Event masks for [`FileNotifier::watch`], matching `inotify(7)`.
pub const ACCESS: u32 = libc::IN_ACCESS;
pub const MODIFY: u32 = libc::IN_MODIFY;
pub const ATTRIB: u32 = libc::IN_ATTRIB;
pub const CLOSE_WRITE: u32 = libc::IN_CLOSE_WRITE;
pub const CLOSE_NOWRITE: u32 = libc::IN_CLOSE_NOWRITE;
pub const OPEN: u32 = libc::IN_OPEN;
pub const MOVED_FROM: u32 = libc::IN_MOVED_FROM;
pub const MOVED_TO: u32 = libc::IN_MOVED_TO;
pub const CREATE: u32 = libc::IN_CREATE;
pub const DELETE: u32 = libc::IN_DELETE;
pub const DELETE_SELF: u32 = libc::IN_DELETE_SELF;
pub const MOVE_SELF: u32 = libc::IN_MOVE_SELF;
pub const ALL_EVENTS: u32 = libc::IN_ALL_EVENTS;

/// A single file-change notification.
pub struct NotifyEvent {
    /// The watched path the event belongs to.
    pub path: PathBuf,
    /// For events inside a watched directory, the entry name.
    pub name: Option<OsString>,
    /// Bitmask of the events that occurred.
    pub mask: u32,
    /// Correlates the two halves of a rename.
    pub cookie: u32,
}

struct Watch {
    path: PathBuf,
    cb: Arc<dyn Fn(&NotifyEvent) + Send + Sync>,
}

#[derive(Default)]
struct NotifyState {
    watches: HashMap<libc::c_int, Watch>,
    read_pending: bool,
}

/// File-change notifications (`inotify`) delivered through the reactor.
///
/// One kernel notification queue serves any number of watched paths; the
/// notifier keeps a read of the event buffer queued and dispatches parsed
/// events to the per-watch callbacks on the reactor thread.
pub struct FileNotifier {
    inner: FdConnection,
    me: Weak<FileNotifier>,
    state: Mutex<NotifyState>,
}

impl FileNotifier {
    pub fn new(handler: &Handle) -> io::Result<Arc<FileNotifier>> {
        let fd = syscall!(inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC))?;
        Ok(Arc::new_cyclic(|me| FileNotifier {
            inner: FdConnection::new(handler.clone(), fd, false),
            me: me.clone(),
            state: Mutex::new(NotifyState::default()),
        }))
    }

    /// Watch `path` for the events in `mask`; returns the watch descriptor.
    pub fn watch<P, F>(&self, path: P, mask: u32, cb: F) -> io::Result<libc::c_int>
    where
        P: AsRef<Path>,
        F: Fn(&NotifyEvent) + Send + Sync + 'static,
    {
        let path = path.as_ref();
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let wd = syscall!(inotify_add_watch(self.handle(), cpath.as_ptr(), mask))?;

        let mut st = self.state.lock().unwrap();
        st.watches.insert(
            wd,
            Watch {
                path: path.to_path_buf(),
                cb: Arc::new(cb),
            },
        );
        match self.ensure_read(&mut st) {
            Ok(()) => Ok(wd),
            Err(e) => {
                st.watches.remove(&wd);
                let _ = syscall!(inotify_rm_watch(self.handle(), wd));
                Err(e)
            }
        }
    }

    /// Stop watching; the watch descriptor comes from [`watch`].
    ///
    /// [`watch`]: FileNotifier::watch
    pub fn unwatch(&self, wd: libc::c_int) -> io::Result<()> {
        syscall!(inotify_rm_watch(self.handle(), wd))?;
        self.state.lock().unwrap().watches.remove(&wd);
        Ok(())
    }

    fn ensure_read(&self, st: &mut NotifyState) -> io::Result<()> {
        if st.read_pending {
            return Ok(());
        }
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return Err(io::Error::from_raw_os_error(libc::EBADF)),
        };
        st.read_pending = true;
        let weak = self.me.clone();
        let result = me.read(
            vec![0u8; 4096],
            move |ior| {
                if let Some(notifier) = weak.upgrade() {
                    notifier.on_events(ior);
                }
                false
            },
            None,
        );
        if result.is_err() {
            st.read_pending = false;
        }
        result
    }

    /// Completion of the event-buffer read; reactor-thread context.
    fn on_events(&self, ior: IoResult) {
        let n = match &ior.result {
            Ok(n) => *n,
            Err(e) => {
                if e.raw_os_error() != Some(libc::ECANCELED) {
                    warn!("notification read failed: {}", e);
                }
                self.state.lock().unwrap().read_pending = false;
                return;
            }
        };

        let mut pending = Vec::new();
        {
            let mut st = self.state.lock().unwrap();
            let buf = &ior.buf[..n];
            let header = mem::size_of::<libc::inotify_event>();
            let mut offset = 0;
            while offset + header <= buf.len() {
                let ev: libc::inotify_event =
                    unsafe { std::ptr::read_unaligned(buf.as_ptr().add(offset) as *const _) };
                let name_end = offset + header + ev.len as usize;
                let raw_name = &buf[offset + header..name_end.min(buf.len())];
                offset = name_end;

                let watch = match st.watches.get(&ev.wd) {
                    Some(watch) => watch,
                    None => continue,
                };
                // The name field is NUL-padded to its recorded length.
                let name_len = raw_name
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(raw_name.len());
                let name = if name_len == 0 {
                    None
                } else {
                    Some(OsString::from_vec(raw_name[..name_len].to_vec()))
                };
                pending.push((
                    watch.cb.clone(),
                    NotifyEvent {
                        path: watch.path.clone(),
                        name,
                        mask: ev.mask,
                        cookie: ev.cookie,
                    },
                ));
            }

            st.read_pending = false;
            let _ = self.ensure_read(&mut st);
        }

        for (cb, event) in &pending {
            cb(event);
        }
    }
}

impl Connection for FileNotifier {
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
