use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::conn::{Connection, IoCallback};
use crate::interest::Interest;
use crate::ops::{Direction, FdOps, OpRef, Operation, Peer, TimeoutQueue};
use crate::sys;

/// Drives submitted operations to completion.
///
/// An `IoHandler` owns one reactor: a readiness backend, per-descriptor
/// operation queues, and a timeout index. Connections are registered
/// implicitly by submitting operations on them; completion callbacks always
/// run on the reactor thread.
///
/// The reactor runs either on a worker thread ([`run(true)`]) or on the
/// calling thread ([`run(false)`]). Dropping the handler stops the loop,
/// joins the worker and completes every pending operation with `ECANCELED`.
///
/// [`run(true)`]: IoHandler::run
/// [`run(false)`]: IoHandler::run
pub struct IoHandler {
    handle: Handle,
}

/// A cheap, cloneable reference to a reactor, held by connections.
///
/// All submission and cancellation goes through a `Handle`; the owning
/// [`IoHandler`] adds lifecycle control on top.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Inner>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct CancelReq {
    fd: RawFd,
    read: bool,
    write: bool,
    /// Only operations submitted before the cancel (id below the watermark)
    /// belong to its cancelled set.
    max_id: u64,
}

/// A completion waiting to be delivered on the reactor thread.
struct Deferred {
    op: Operation,
    errnum: i32,
    fd: RawFd,
    dir: Direction,
}

#[derive(Default)]
struct State {
    lifecycle: Lifecycle,
    ops: HashMap<RawFd, FdOps>,
    timeouts: TimeoutQueue,
    next_id: u64,
    /// The operation currently being serviced by the drain step, removed
    /// from its queue while its transfer or callback runs.
    in_flight: Option<OpRef>,
    /// Completions to be delivered on the reactor thread.
    deferred: VecDeque<Deferred>,
    /// Cancellation tickets: `cancel_done` trails `cancel_ticket` until the
    /// reactor has flushed the corresponding pass.
    cancel_ticket: u64,
    cancel_done: u64,
    cancel_reqs: Vec<CancelReq>,
}

struct Inner {
    selector: sys::Selector,
    signal: sys::ControlSignal,
    state: Mutex<State>,
    cancel_cv: Condvar,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    /// Kernel tid of the thread running the loop; 0 while no loop runs.
    worker_tid: AtomicI32,
    quit: AtomicBool,
}

impl IoHandler {
    /// Create a reactor using the default control signal (`SIGRTMIN`).
    pub fn new() -> io::Result<IoHandler> {
        IoHandler::with_signal(sys::default_signal())
    }

    /// Create a reactor using the given realtime signal for cross-thread
    /// wakeup. Change this if the application uses `SIGRTMIN` for other
    /// purposes.
    pub fn with_signal(signum: i32) -> io::Result<IoHandler> {
        let selector = sys::Selector::new()?;
        let signal = sys::ControlSignal::install(signum)?;
        Ok(IoHandler {
            handle: Handle {
                inner: Arc::new(Inner {
                    selector,
                    signal,
                    state: Mutex::new(State::default()),
                    cancel_cv: Condvar::new(),
                    worker: Mutex::new(None),
                    worker_tid: AtomicI32::new(0),
                    quit: AtomicBool::new(false),
                }),
            },
        })
    }

    /// A cloneable handle for constructing connections.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Run the reactor until [`stop`] is called or it fails.
    ///
    /// With `start_worker` a new thread runs the loop and `run` returns
    /// immediately; otherwise the loop runs on the calling thread and `run`
    /// returns when it exits. Fails with `EALREADY` if the reactor is not
    /// stopped.
    ///
    /// [`stop`]: IoHandler::stop
    pub fn run(&self, start_worker: bool) -> io::Result<()> {
        let inner = &self.handle.inner;
        {
            let mut st = inner.state.lock().unwrap();
            if st.lifecycle != Lifecycle::Stopped {
                return Err(io::Error::from_raw_os_error(libc::EALREADY));
            }
            st.lifecycle = Lifecycle::Starting;
            inner.quit.store(false, Ordering::SeqCst);
            if start_worker {
                let loop_inner = Arc::clone(inner);
                let worker = thread::Builder::new()
                    .name("iomux-reactor".to_owned())
                    .spawn(move || {
                        let _ = loop_inner.run_loop();
                    });
                match worker {
                    Ok(worker) => *inner.worker.lock().unwrap() = Some(worker),
                    Err(e) => {
                        st.lifecycle = Lifecycle::Stopped;
                        return Err(e);
                    }
                }
            }
        }
        if start_worker {
            Ok(())
        } else {
            inner.run_loop()
        }
    }

    /// Ask the loop to exit. Does not wait for it; see [`join`].
    ///
    /// [`join`]: IoHandler::join
    pub fn stop(&self) {
        self.handle.inner.quit.store(true, Ordering::SeqCst);
        self.handle.inner.kick();
    }

    /// Wait for the worker thread, if one was started, to finish.
    pub fn join(&self) {
        if self.same_thread() {
            return;
        }
        let worker = self.handle.inner.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    /// True when the calling thread is the reactor thread.
    pub fn same_thread(&self) -> bool {
        self.handle.same_thread()
    }

    /// Cancel pending operations on `conn`; each completes with `ECANCELED`.
    ///
    /// With `fast` the cancellation is scheduled and the call returns at
    /// once; without it, a call from outside the reactor thread blocks until
    /// no callback of the cancelled operations can fire anymore.
    pub fn cancel(&self, conn: &dyn Connection, read: bool, write: bool, fast: bool) {
        self.handle.cancel_fd(conn.handle(), read, write, fast);
    }
}

impl Drop for IoHandler {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl std::fmt::Debug for IoHandler {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("IoHandler").finish()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Handle").finish()
    }
}

impl Handle {
    /// True when the calling thread is the reactor thread.
    pub fn same_thread(&self) -> bool {
        self.inner.same_thread()
    }

    /// Cancel by raw descriptor; used by [`Connection::cancel`].
    pub fn cancel_fd(&self, fd: RawFd, read: bool, write: bool, fast: bool) {
        self.inner.cancel(fd, read, write, fast);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit(
        &self,
        dir: Direction,
        conn: Arc<dyn Connection>,
        buf: Vec<u8>,
        size: usize,
        dummy: bool,
        peer: Peer,
        cb: IoCallback,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        self.inner.submit(dir, conn, buf, size, dummy, peer, cb, timeout)
    }
}

impl Inner {
    fn same_thread(&self) -> bool {
        let tid = self.worker_tid.load(Ordering::SeqCst);
        tid != 0 && tid == sys::current_tid()
    }

    fn kick(&self) {
        let tid = self.worker_tid.load(Ordering::SeqCst);
        if tid != 0 {
            self.signal.kick(tid);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn submit(
        &self,
        dir: Direction,
        conn: Arc<dyn Connection>,
        buf: Vec<u8>,
        size: usize,
        dummy: bool,
        peer: Peer,
        cb: IoCallback,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let fd = conn.handle();
        if fd < 0 || !conn.is_open() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let mut st = self.state.lock().unwrap();
        if !matches!(st.lifecycle, Lifecycle::Starting | Lifecycle::Running) {
            return Err(io::Error::from_raw_os_error(libc::ESHUTDOWN));
        }

        let id = st.next_id;
        st.next_id += 1;
        let deadline = timeout.map(|t| (Instant::now() + t, id));
        let earliest_changed = match deadline {
            Some(key) => st.timeouts.insert(key, OpRef { fd, dir, id }),
            None => false,
        };
        st.ops.entry(fd).or_default().queue_mut(dir).push_back(Operation::new(
            id, conn, buf, size, dummy, peer, timeout, deadline, cb,
        ));
        trace!("queued op {} for fd {} ({:?})", id, fd, dir);

        let mask_changed = match self.sync_interest(&mut st, fd) {
            Ok(changed) => changed,
            Err(e) => {
                // Roll the submission back; the failure is synchronous.
                if let Some(entry) = st.ops.get_mut(&fd) {
                    entry.remove(dir, id);
                }
                if let Some(key) = deadline {
                    st.timeouts.remove(&key);
                }
                let _ = self.sync_interest(&mut st, fd);
                return Err(e);
            }
        };
        drop(st);

        if (mask_changed || earliest_changed) && !self.same_thread() {
            self.kick();
        }
        Ok(())
    }

    fn cancel(&self, fd: RawFd, read: bool, write: bool, fast: bool) {
        if fd < 0 || (!read && !write) {
            return;
        }
        let same = self.same_thread();
        let mut st = self.state.lock().unwrap();
        let max_id = st.next_id;

        let mut cancelled: Vec<(Operation, Direction)> = Vec::new();
        if let Some(entry) = st.ops.get_mut(&fd) {
            if read {
                cancelled.extend(entry.read.drain(..).map(|op| (op, Direction::Read)));
            }
            if write {
                cancelled.extend(entry.write.drain(..).map(|op| (op, Direction::Write)));
            }
        }
        for (op, _) in &cancelled {
            if let Some(key) = op.deadline {
                st.timeouts.remove(&key);
            }
        }
        let _ = self.sync_interest(&mut st, fd);

        if same {
            // Inline path: the reactor thread is the caller, so running the
            // callbacks right here preserves the no-further-callbacks
            // guarantee without any handshake.
            if fast {
                st.deferred.extend(cancelled.into_iter().map(|(op, dir)| Deferred {
                    op,
                    errnum: libc::ECANCELED,
                    fd,
                    dir,
                }));
            } else {
                drop(st);
                for (op, _) in cancelled {
                    op.complete(Err(io::Error::from_raw_os_error(libc::ECANCELED)), None);
                }
            }
            return;
        }

        let in_flight_hit = st.in_flight.map_or(false, |r| {
            r.fd == fd
                && match r.dir {
                    Direction::Read => read,
                    Direction::Write => write,
                }
        });
        let deferred_hit = st.deferred.iter().any(|d| {
            d.fd == fd
                && match d.dir {
                    Direction::Read => read,
                    Direction::Write => write,
                }
        });
        if cancelled.is_empty() && !in_flight_hit && !deferred_hit {
            // Nothing queued, nothing being serviced, nothing awaiting
            // delivery: a no-op, also for operations that already completed.
            return;
        }

        st.deferred.extend(cancelled.into_iter().map(|(op, dir)| Deferred {
            op,
            errnum: libc::ECANCELED,
            fd,
            dir,
        }));
        st.cancel_ticket += 1;
        let ticket = st.cancel_ticket;
        st.cancel_reqs.push(CancelReq {
            fd,
            read,
            write,
            max_id,
        });
        self.kick();
        if fast {
            return;
        }
        while st.cancel_done < ticket && st.lifecycle != Lifecycle::Stopped {
            st = self.cancel_cv.wait(st).unwrap();
        }
    }

    /// Bring the backend subscription of `fd` in line with its queues and
    /// drop the bookkeeping entry once both queues are empty and no drain
    /// step is active on it. Returns whether the subscription changed.
    fn sync_interest(&self, st: &mut State, fd: RawFd) -> io::Result<bool> {
        let in_flight = st.in_flight;
        let entry = match st.ops.get_mut(&fd) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        let in_flight_dir = in_flight.and_then(|r| (r.fd == fd).then_some(r.dir));

        let read_wanted = !entry.read.is_empty() || in_flight_dir == Some(Direction::Read);
        let write_wanted = !entry.write.is_empty() || in_flight_dir == Some(Direction::Write);
        let desired = match (read_wanted, write_wanted) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        let changed = entry.subscribed != desired;
        match (entry.subscribed, desired) {
            (None, Some(interest)) => {
                if !entry.always_ready {
                    match self.selector.register(fd, interest) {
                        Ok(()) => {}
                        Err(ref e) if e.raw_os_error() == Some(libc::EPERM) => {
                            // epoll refuses plain files; drain them every
                            // iteration instead.
                            entry.always_ready = true;
                        }
                        Err(e) => return Err(e),
                    }
                }
                entry.subscribed = Some(interest);
            }
            (Some(_), None) => {
                if !entry.always_ready {
                    // The descriptor may already be closed, in which case
                    // the kernel dropped the registration on its own.
                    if let Err(e) = self.selector.deregister(fd) {
                        trace!("deregistering fd {} failed: {}", fd, e);
                    }
                }
                entry.subscribed = None;
            }
            (Some(_), Some(interest)) if changed => {
                if !entry.always_ready {
                    self.selector.reregister(fd, interest)?;
                }
                entry.subscribed = Some(interest);
            }
            _ => {}
        }

        if desired.is_none() && in_flight_dir.is_none() {
            st.ops.remove(&fd);
        }
        Ok(changed)
    }

    fn run_loop(&self) -> io::Result<()> {
        let wait_mask = match self.signal.block().and_then(|()| self.signal.wait_mask()) {
            Ok(mask) => mask,
            Err(e) => {
                error!("reactor startup failed: {}", e);
                self.end_running();
                return Err(e);
            }
        };

        self.worker_tid.store(sys::current_tid(), Ordering::SeqCst);
        self.state.lock().unwrap().lifecycle = Lifecycle::Running;
        trace!("reactor loop started");

        let mut events = sys::Events::with_capacity(256);
        let mut failure = None;

        while !self.quit.load(Ordering::SeqCst) {
            let timeout = self.wait_timeout();
            match self.selector.select(&mut events, timeout, &wait_mask) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    // Control signal: fall through to apply whatever state
                    // change the signalling thread made.
                }
                Err(e) => {
                    error!("readiness wait failed: {}", e);
                    failure = Some(e);
                    break;
                }
            }

            let now = Instant::now();
            self.dispatch_timeouts(now);
            self.dispatch_events(&events);
            self.drain_always_ready();
            self.flush_deferred();
        }

        self.end_running();
        trace!("reactor loop finished");
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// How long the next wait may block: zero when deliverable work is
    /// already pending, the delta to the earliest deadline otherwise.
    fn wait_timeout(&self) -> Option<Duration> {
        let st = self.state.lock().unwrap();
        if !st.deferred.is_empty() || !st.cancel_reqs.is_empty() {
            return Some(Duration::ZERO);
        }
        if st.ops.values().any(|e| e.always_ready && e.has_pending()) {
            return Some(Duration::ZERO);
        }
        st.timeouts
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn dispatch_timeouts(&self, now: Instant) {
        loop {
            let mut st = self.state.lock().unwrap();
            let opref = match st.timeouts.pop_expired(now) {
                Some(opref) => opref,
                None => break,
            };
            let op = match st
                .ops
                .get_mut(&opref.fd)
                .and_then(|entry| entry.remove(opref.dir, opref.id))
            {
                Some(op) => op,
                None => continue,
            };
            let _ = self.sync_interest(&mut st, opref.fd);
            drop(st);
            trace!("op {} on fd {} timed out", opref.id, opref.fd);
            op.complete(Err(io::Error::from_raw_os_error(libc::ETIMEDOUT)), None);
        }
    }

    fn dispatch_events(&self, events: &sys::Events) {
        for ev in events.iter() {
            let fd = sys::event::fd(ev);
            if sys::event::is_readable(ev) {
                self.drain(fd, Direction::Read);
            }
            if sys::event::is_writable(ev) {
                self.drain(fd, Direction::Write);
            }
        }
    }

    fn drain_always_ready(&self) {
        let ready: Vec<RawFd> = {
            let st = self.state.lock().unwrap();
            st.ops
                .iter()
                .filter(|(_, entry)| entry.always_ready && entry.has_pending())
                .map(|(fd, _)| *fd)
                .collect()
        };
        for fd in ready {
            self.drain(fd, Direction::Read);
            self.drain(fd, Direction::Write);
        }
    }

    /// Service one direction of one descriptor until it would block, the
    /// queue empties, or a callback asks to stop.
    fn drain(&self, fd: RawFd, dir: Direction) {
        loop {
            let mut st = self.state.lock().unwrap();
            let op = match st.ops.get_mut(&fd) {
                Some(entry) => entry.queue_mut(dir).pop_front(),
                None => None,
            };
            let mut op = match op {
                Some(op) => op,
                None => break,
            };
            st.in_flight = Some(OpRef { fd, dir, id: op.id });
            drop(st);

            let mut peer = None;
            let result = if op.dummy {
                Ok(0)
            } else {
                let size = op.size;
                loop {
                    let res = match dir {
                        Direction::Read => match op.peer {
                            Peer::Recv => op.conn.do_recv_from(&mut op.buf[..size]).map(|(n, p)| {
                                peer = p;
                                n
                            }),
                            _ => op.conn.do_read(&mut op.buf[..size]),
                        },
                        Direction::Write => match &op.peer {
                            Peer::Send(addr) => {
                                let addr = *addr;
                                peer = Some(addr);
                                op.conn.do_send_to(&op.buf[..size], &addr)
                            }
                            _ => op.conn.do_write(&op.buf[..size]),
                        },
                    };
                    match res {
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        res => break res,
                    }
                }
            };

            if matches!(&result, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
                let mut st = self.state.lock().unwrap();
                st.in_flight = None;
                let entry_gone = !st.ops.contains_key(&fd);
                if covered_by_cancel(&st.cancel_reqs, fd, dir, op.id) || entry_gone {
                    // A cancel raced the transfer (or, without a bookkeeping
                    // entry left, the descriptor was closed underneath it).
                    if let Some(key) = op.deadline {
                        st.timeouts.remove(&key);
                    }
                    st.deferred.push_back(Deferred {
                        op,
                        errnum: libc::ECANCELED,
                        fd,
                        dir,
                    });
                } else if let Some(entry) = st.ops.get_mut(&fd) {
                    entry.queue_mut(dir).push_front(op);
                }
                let _ = self.sync_interest(&mut st, fd);
                break;
            }

            let mut st = self.state.lock().unwrap();
            st.in_flight = None;
            if let Some(key) = op.deadline {
                st.timeouts.remove(&key);
            }
            let _ = self.sync_interest(&mut st, fd);
            drop(st);

            let keep_draining = op.complete(result, peer);
            if !keep_draining {
                break;
            }
        }
    }

    /// Deliver deferred completions and acknowledge the cancellation passes
    /// they belonged to.
    fn flush_deferred(&self) {
        let (work, acked) = {
            let mut st = self.state.lock().unwrap();
            let acked = st.cancel_ticket;
            st.cancel_reqs.clear();
            (mem::take(&mut st.deferred), acked)
        };
        for d in work {
            d.op
                .complete(Err(io::Error::from_raw_os_error(d.errnum)), None);
        }
        let mut st = self.state.lock().unwrap();
        if st.cancel_done < acked {
            st.cancel_done = acked;
            self.cancel_cv.notify_all();
        }
    }

    /// Complete every remaining operation with `ECANCELED` and return the
    /// reactor to the stopped state. Runs on the loop thread.
    fn end_running(&self) {
        let (deferred, swept) = {
            let mut st = self.state.lock().unwrap();
            st.lifecycle = Lifecycle::Stopping;
            st.in_flight = None;
            st.timeouts.clear();
            (mem::take(&mut st.deferred), mem::take(&mut st.ops))
        };
        for d in deferred {
            d.op
                .complete(Err(io::Error::from_raw_os_error(d.errnum)), None);
        }
        for (fd, mut entry) in swept {
            if entry.subscribed.is_some() && !entry.always_ready {
                let _ = self.selector.deregister(fd);
            }
            for op in entry.read.drain(..).chain(entry.write.drain(..)) {
                op.complete(Err(io::Error::from_raw_os_error(libc::ECANCELED)), None);
            }
        }

        let mut st = self.state.lock().unwrap();
        st.cancel_done = st.cancel_ticket;
        st.cancel_reqs.clear();
        st.lifecycle = Lifecycle::Stopped;
        drop(st);
        self.worker_tid.store(0, Ordering::SeqCst);
        self.cancel_cv.notify_all();
    }
}

fn covered_by_cancel(reqs: &[CancelReq], fd: RawFd, dir: Direction, id: u64) -> bool {
    reqs.iter().any(|r| {
        r.fd == fd
            && id < r.max_id
            && match dir {
                Direction::Read => r.read,
                Direction::Write => r.write,
            }
    })
}
