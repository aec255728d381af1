use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::conn::{Connection, IoCallback, IoResult};
use crate::interest::Interest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Datagram peer slot of an operation. `Recv` asks the draining step for the
/// sender address, `Send` carries the destination.
pub(crate) enum Peer {
    None,
    Recv,
    Send(SocketAddr),
}

/// A single submitted I/O request, owned by the queue it sits in from
/// submission until its callback has been handed the result.
pub(crate) struct Operation {
    /// Stable id; doubles as the tie-breaker in the timeout index.
    pub(crate) id: u64,
    pub(crate) conn: Arc<dyn Connection>,
    pub(crate) buf: Vec<u8>,
    pub(crate) size: usize,
    pub(crate) dummy: bool,
    pub(crate) peer: Peer,
    pub(crate) timeout: Option<Duration>,
    /// Back-key into the timeout index; removal is always paired with it.
    pub(crate) deadline: Option<(Instant, u64)>,
    cb: Option<IoCallback>,
}

impl Operation {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        conn: Arc<dyn Connection>,
        buf: Vec<u8>,
        size: usize,
        dummy: bool,
        peer: Peer,
        timeout: Option<Duration>,
        deadline: Option<(Instant, u64)>,
        cb: IoCallback,
    ) -> Operation {
        Operation {
            id,
            conn,
            buf,
            size,
            dummy,
            peer,
            timeout,
            deadline,
            cb: Some(cb),
        }
    }

    /// Hand the result to the completion callback. Returns the callback's
    /// "keep draining this queue" hint.
    pub(crate) fn complete(
        mut self,
        result: io::Result<usize>,
        peer: Option<SocketAddr>,
    ) -> bool {
        let cb = self.cb.take().expect("operation completed twice");
        let ior = IoResult {
            buf: mem::take(&mut self.buf),
            size: self.size,
            result,
            peer,
            timeout: self.timeout,
        };
        cb(ior)
    }
}

/// A reference identifying a queued operation without owning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpRef {
    pub(crate) fd: RawFd,
    pub(crate) dir: Direction,
    pub(crate) id: u64,
}

/// Per-descriptor state: the two FIFO queues and the interest currently
/// subscribed with the backend.
#[derive(Default)]
pub(crate) struct FdOps {
    pub(crate) read: VecDeque<Operation>,
    pub(crate) write: VecDeque<Operation>,
    pub(crate) subscribed: Option<Interest>,
    /// Descriptors epoll refuses (`EPERM`, e.g. regular files) are treated
    /// as permanently ready and drained every loop iteration instead.
    pub(crate) always_ready: bool,
}

impl FdOps {
    pub(crate) fn queue_mut(&mut self, dir: Direction) -> &mut VecDeque<Operation> {
        match dir {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.read.is_empty() || !self.write.is_empty()
    }

    /// Remove a queued operation by id. The queues are short in practice;
    /// a linear scan keeps the record type free of intrusive links.
    pub(crate) fn remove(&mut self, dir: Direction, id: u64) -> Option<Operation> {
        let queue = self.queue_mut(dir);
        let pos = queue.iter().position(|op| op.id == id)?;
        queue.remove(pos)
    }
}

/// Time-ordered index over every operation with a finite timeout.
///
/// Keys are (absolute deadline, submission sequence), so entries with equal
/// deadlines fire in submission order.
#[derive(Default)]
pub(crate) struct TimeoutQueue {
    map: BTreeMap<(Instant, u64), OpRef>,
}

impl TimeoutQueue {
    /// Insert an entry; returns true when it became the new earliest
    /// deadline, which is when the reactor's wait needs re-arming.
    pub(crate) fn insert(&mut self, key: (Instant, u64), op: OpRef) -> bool {
        self.map.insert(key, op);
        *self.map.keys().next().unwrap() == key
    }

    pub(crate) fn remove(&mut self, key: &(Instant, u64)) {
        self.map.remove(key);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.map.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pop the earliest entry whose deadline has passed.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<OpRef> {
        let key = *self.map.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.map.remove(&key)
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn op_ref(id: u64) -> OpRef {
        OpRef {
            fd: 1,
            dir: Direction::Read,
            id,
        }
    }

    #[test]
    fn expiry_order_is_deadline_then_submission() {
        let mut q = TimeoutQueue::default();
        let base = Instant::now();
        let later = base + Duration::from_millis(10);

        assert!(q.insert((later, 1), op_ref(1)));
        assert!(q.insert((base, 2), op_ref(2)));
        // Same deadline as id 2, submitted afterwards.
        assert!(!q.insert((base, 3), op_ref(3)));

        let now = base + Duration::from_millis(20);
        assert_eq!(q.pop_expired(now).unwrap().id, 2);
        assert_eq!(q.pop_expired(now).unwrap().id, 3);
        assert_eq!(q.pop_expired(now).unwrap().id, 1);
        assert!(q.pop_expired(now).is_none());
    }

    #[test]
    fn unexpired_entries_stay_put() {
        let mut q = TimeoutQueue::default();
        let deadline = Instant::now() + Duration::from_secs(60);
        q.insert((deadline, 1), op_ref(1));
        assert!(q.pop_expired(Instant::now()).is_none());
        assert_eq!(q.next_deadline(), Some(deadline));
    }
}
