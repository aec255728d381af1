use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::interest::Interest;

/// Readiness backend backed by `epoll(7)`.
///
/// Descriptors are registered level-triggered; the reactor keeps the
/// registered event mask equal to its per-descriptor queue state and drains
/// until `WouldBlock`, so edge semantics are not needed. The event payload is
/// the raw descriptor itself since all reactor state is keyed by fd.
#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    /// Wait for events, a timeout, or a control-signal delivery.
    ///
    /// `sigmask` is installed for the duration of the wait, which is what
    /// atomically unblocks the control signal so that a `tgkill` from another
    /// thread interrupts the wait with `Interrupted` instead of being lost.
    pub(crate) fn select(
        &self,
        events: &mut Events,
        timeout: Option<Duration>,
        sigmask: &libc::sigset_t,
    ) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout, unless
                // the caller explicitly requests that by specifying a zero
                // timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        syscall!(epoll_pwait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout,
            sigmask,
        ))
        .map(|n_events| {
            // This is safe because `epoll_pwait` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    pub(crate) fn register(&self, fd: RawFd, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: fd as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn reregister(&self, fd: RawFd, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: fd as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())).map(|_| ())
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    let mut kind = 0;

    if interests.is_readable() {
        kind = kind | EPOLLIN | EPOLLRDHUP;
    }

    if interests.is_writable() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::*;

    pub(crate) fn fd(event: &Event) -> RawFd {
        event.u64 as RawFd
    }

    /// Error and hangup conditions are folded into both directions: the
    /// draining step observes the actual condition through the errno of the
    /// connection's read/write primitive.
    pub(crate) fn is_readable(event: &Event) -> bool {
        (event.events as libc::c_int & (EPOLLIN | EPOLLRDHUP | EPOLLERR | EPOLLHUP)) != 0
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        (event.events as libc::c_int & (EPOLLOUT | EPOLLERR | EPOLLHUP)) != 0
    }
}
