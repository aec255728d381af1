use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::sync::{Mutex, OnceLock};

/// Handler installations per signal number, shared by every reactor in the
/// process. The handler is installed when the first reactor using a signal
/// number is created and the original disposition is restored when the last
/// one is dropped.
struct Installed {
    count: usize,
    original: libc::sigaction,
}

static INSTALLED: OnceLock<Mutex<HashMap<libc::c_int, Installed>>> = OnceLock::new();

fn installed() -> &'static Mutex<HashMap<libc::c_int, Installed>> {
    INSTALLED.get_or_init(|| Mutex::new(HashMap::new()))
}

// The handler only exists to interrupt `epoll_pwait` with `EINTR`.
extern "C" fn wake_handler(_signum: libc::c_int) {}

// `pthread_sigmask` reports failure through its return value, not `errno`.
fn pthread_sigmask(
    how: libc::c_int,
    set: *const libc::sigset_t,
    old: *mut libc::sigset_t,
) -> io::Result<()> {
    match unsafe { libc::pthread_sigmask(how, set, old) } {
        0 => Ok(()),
        err => Err(io::Error::from_raw_os_error(err)),
    }
}

/// The realtime signal used to rouse a reactor thread out of its wait.
///
/// The signal is blocked in the installing thread (and every thread spawned
/// from it afterwards) and only unblocked for the duration of the reactor's
/// wait primitive, so a delivery can never run the handler anywhere except
/// inside that wait.
#[derive(Debug)]
pub(crate) struct ControlSignal {
    signum: libc::c_int,
}

impl ControlSignal {
    pub(crate) fn install(signum: libc::c_int) -> io::Result<ControlSignal> {
        let mut installed = installed().lock().unwrap();
        if let Some(entry) = installed.get_mut(&signum) {
            entry.count += 1;
        } else {
            let mut action: libc::sigaction = unsafe { MaybeUninit::zeroed().assume_init() };
            action.sa_sigaction = wake_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
            unsafe { libc::sigemptyset(&mut action.sa_mask) };

            let mut original: libc::sigaction = unsafe { MaybeUninit::zeroed().assume_init() };
            syscall!(sigaction(signum, &action, &mut original))?;
            installed.insert(signum, Installed { count: 1, original });
        }
        drop(installed);

        block_in_this_thread(signum)?;
        Ok(ControlSignal { signum })
    }

    pub(crate) fn signum(&self) -> libc::c_int {
        self.signum
    }

    /// Make sure the signal is blocked in the calling thread. Used by the
    /// reactor loop in case it runs on a thread created before the signal
    /// handler was installed.
    pub(crate) fn block(&self) -> io::Result<()> {
        block_in_this_thread(self.signum)
    }

    /// The calling thread's signal mask with the control signal removed,
    /// for use as the `epoll_pwait` mask.
    pub(crate) fn wait_mask(&self) -> io::Result<libc::sigset_t> {
        let mut mask = unsafe { MaybeUninit::<libc::sigset_t>::zeroed().assume_init() };
        pthread_sigmask(libc::SIG_SETMASK, std::ptr::null(), &mut mask)?;
        unsafe { libc::sigdelset(&mut mask, self.signum) };
        Ok(mask)
    }

    /// Deliver the control signal to the reactor thread.
    ///
    /// A stale tid (the loop exited between the caller reading it and the
    /// kill) gives `ESRCH`, which is fine: a dead loop needs no waking.
    pub(crate) fn kick(&self, tid: libc::pid_t) {
        unsafe {
            libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, self.signum);
        }
    }
}

impl Drop for ControlSignal {
    fn drop(&mut self) {
        let mut installed = installed().lock().unwrap();
        if let Some(entry) = installed.get_mut(&self.signum) {
            entry.count -= 1;
            if entry.count == 0 {
                unsafe { libc::sigaction(self.signum, &entry.original, std::ptr::null_mut()) };
                installed.remove(&self.signum);
            }
        }
    }
}

pub(crate) fn default_signal() -> libc::c_int {
    libc::SIGRTMIN()
}

pub(crate) fn current_tid() -> libc::pid_t {
    unsafe { libc::gettid() }
}

fn block_in_this_thread(signum: libc::c_int) -> io::Result<()> {
    let mut set = unsafe { MaybeUninit::<libc::sigset_t>::zeroed().assume_init() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signum);
    }
    pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut())
}
