use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::conn::{Connection, ConnectionExt, IoResult};
use crate::fd::FdConnection;
use crate::handler::Handle;

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

#[derive(Default)]
struct TimerState {
    cb: Option<Arc<dyn Fn() + Send + Sync>>,
    repeating: bool,
    /// The overrun read stays queued across repeating expirations; only one
    /// may be outstanding at a time.
    read_pending: bool,
}

/// A timer driven through the reactor like any other connection.
///
/// The kernel timer (`timerfd`, boot-time clock) becomes readable on
/// expiration; the reactor services a queued read of the overrun word and
/// the user callback is invoked from its completion. For repeating timers
/// the read is resubmitted from that same completion.
pub struct TimerConnection {
    inner: FdConnection,
    me: Weak<TimerConnection>,
    state: Mutex<TimerState>,
}

impl TimerConnection {
    pub fn new(handler: &Handle) -> io::Result<Arc<TimerConnection>> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_BOOTTIME,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        Ok(Arc::new_cyclic(|me| TimerConnection {
            inner: FdConnection::new(handler.clone(), fd, false),
            me: me.clone(),
            state: Mutex::new(TimerState::default()),
        }))
    }

    /// Arm the timer: `cb` runs on the reactor thread after `initial`, and
    /// with `interval` again after every further interval. Re-arming an
    /// active timer replaces its schedule and callback.
    pub fn set<F>(&self, initial: Duration, interval: Option<Duration>, cb: F) -> io::Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut st = self.state.lock().unwrap();
        if !self.is_open() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let mut it: libc::itimerspec = unsafe { mem::zeroed() };
        it.it_value = timespec(initial);
        if it.it_value.tv_sec == 0 && it.it_value.tv_nsec == 0 {
            // All-zero disarms the timer; expire as soon as possible instead.
            it.it_value.tv_nsec = 1;
        }
        if let Some(interval) = interval {
            it.it_interval = timespec(interval);
        }
        syscall!(timerfd_settime(self.handle(), 0, &it, std::ptr::null_mut()))?;

        st.cb = Some(Arc::new(cb));
        st.repeating = interval.is_some();
        if !st.read_pending {
            let me = match self.me.upgrade() {
                Some(me) => me,
                None => return Err(io::Error::from_raw_os_error(libc::EBADF)),
            };
            st.read_pending = true;
            drop(st);
            let weak = self.me.clone();
            let result = me.read(
                vec![0u8; 8],
                move |ior| {
                    if let Some(timer) = weak.upgrade() {
                        timer.on_expire(ior);
                    }
                    false
                },
                None,
            );
            if let Err(e) = result {
                let mut st = self.state.lock().unwrap();
                st.read_pending = false;
                st.cb = None;
                let _ = self.disarm();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Disarm the timer and drop its callback. Pending expirations will not
    /// be delivered.
    pub fn cancel(&self) {
        let mut st = self.state.lock().unwrap();
        st.cb = None;
        st.repeating = false;
        let _ = self.disarm();
    }

    fn disarm(&self) -> io::Result<()> {
        if self.handle() >= 0 {
            let zero: libc::itimerspec = unsafe { mem::zeroed() };
            syscall!(timerfd_settime(self.handle(), 0, &zero, std::ptr::null_mut()))?;
        }
        Ok(())
    }

    /// Completion of the overrun read; reactor-thread context.
    fn on_expire(&self, ior: IoResult) {
        match &ior.result {
            Ok(n) if *n >= 8 => {}
            Ok(_) => return,
            Err(e) => {
                if e.raw_os_error() != Some(libc::ECANCELED) {
                    warn!("timer read failed: {}", e);
                }
                self.state.lock().unwrap().read_pending = false;
                return;
            }
        }
        let overrun = u64::from_ne_bytes(ior.buf[..8].try_into().unwrap());
        trace!("timer fd {} expired ({} expirations)", self.handle(), overrun);

        let mut st = self.state.lock().unwrap();
        let cb = st.cb.clone();
        if st.repeating && cb.is_some() {
            // Resubmit before running the callback, so a cancel from inside
            // it observes the timer fully armed and can retract everything.
            let resubmitted = match self.me.upgrade() {
                Some(me) => {
                    let weak = self.me.clone();
                    me.read(
                        ior.buf,
                        move |ior| {
                            if let Some(timer) = weak.upgrade() {
                                timer.on_expire(ior);
                            }
                            false
                        },
                        None,
                    )
                    .is_ok()
                }
                None => false,
            };
            if !resubmitted {
                st.read_pending = false;
            }
        } else {
            st.read_pending = false;
            st.cb = None;
        }
        drop(st);

        if let Some(cb) = cb {
            cb();
        }
    }
}

impl Connection for TimerConnection {
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

struct TimerEntry {
    id: u64,
    deadline: Instant,
    interval: Option<Duration>,
    cb: Arc<dyn Fn(&TimerSet, u64) + Send + Sync>,
}

#[derive(Default)]
struct SetState {
    /// Sorted by deadline; entries with equal deadlines keep insertion
    /// order.
    entries: Vec<TimerEntry>,
    next_id: u64,
}

/// Any number of one-shot and repeating timers multiplexed over a single
/// [`TimerConnection`].
///
/// The earliest entry drives the kernel timer; every mutation re-arms it
/// under the set's mutex. Callbacks receive the set and the entry id and may
/// add or cancel entries freely.
pub struct TimerSet {
    timer: Arc<TimerConnection>,
    me: Weak<TimerSet>,
    state: Mutex<SetState>,
}

impl TimerSet {
    pub fn new(handler: &Handle) -> io::Result<Arc<TimerSet>> {
        let timer = TimerConnection::new(handler)?;
        Ok(Arc::new_cyclic(|me| TimerSet {
            timer,
            me: me.clone(),
            state: Mutex::new(SetState::default()),
        }))
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().entries.is_empty()
    }

    /// Add a timer entry; returns its id. `cb` runs on the reactor thread
    /// after `delay`, and repeatedly every `interval` if one is given.
    pub fn set<F>(&self, delay: Duration, interval: Option<Duration>, cb: F) -> io::Result<u64>
    where
        F: Fn(&TimerSet, u64) + Send + Sync + 'static,
    {
        let mut st = self.state.lock().unwrap();
        let id = st.next_id;
        st.next_id += 1;
        let deadline = Instant::now() + delay;
        let pos = st.entries.partition_point(|e| e.deadline <= deadline);
        st.entries.insert(
            pos,
            TimerEntry {
                id,
                deadline,
                interval,
                cb: Arc::new(cb),
            },
        );
        if pos == 0 {
            if let Err(e) = self.arm_head(&st) {
                st.entries.remove(0);
                let _ = self.arm_head(&st);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Remove an entry. Unknown ids (and entries that already fired their
    /// last time) are ignored.
    pub fn cancel(&self, id: u64) {
        let mut st = self.state.lock().unwrap();
        let pos = match st.entries.iter().position(|e| e.id == id) {
            Some(pos) => pos,
            None => return,
        };
        st.entries.remove(pos);
        if pos == 0 {
            let _ = self.arm_head(&st);
        }
    }

    /// Remove every entry and disarm the kernel timer.
    pub fn clear(&self) {
        let mut st = self.state.lock().unwrap();
        st.entries.clear();
        self.timer.cancel();
    }

    /// Re-arm the kernel timer to the head entry, or disarm it when empty.
    /// Caller holds the state lock.
    fn arm_head(&self, st: &SetState) -> io::Result<()> {
        match st.entries.first() {
            Some(head) => {
                let delay = head.deadline.saturating_duration_since(Instant::now());
                let weak = self.me.clone();
                self.timer.set(delay, None, move || {
                    if let Some(set) = weak.upgrade() {
                        set.expired();
                    }
                })
            }
            None => {
                self.timer.cancel();
                Ok(())
            }
        }
    }

    /// Kernel timer fired; run every due entry, then re-arm.
    fn expired(&self) {
        loop {
            let mut st = self.state.lock().unwrap();
            let now = Instant::now();
            let head_due = st
                .entries
                .first()
                .map_or(false, |head| head.deadline <= now);
            if !head_due {
                let _ = self.arm_head(&st);
                break;
            }

            let mut entry = st.entries.remove(0);
            let cb = entry.cb.clone();
            let id = entry.id;
            if let Some(interval) = entry.interval {
                entry.deadline += interval;
                let pos = st.entries.partition_point(|e| e.deadline <= entry.deadline);
                st.entries.insert(pos, entry);
            }
            drop(st);
            cb(self, id);
        }
    }
}
