use std::io::Write;
use std::net::Shutdown;
use std::os::fd::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use iomux::{pipe, Connection, ConnectionExt, FdConnection};

mod util;

use util::start_handler;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn cancel_from_other_thread_waits_for_callback() {
    let handler = start_handler();
    let (r, _w) = pipe(&handler.handle()).unwrap();
    let r = Arc::new(r);

    let delivered = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let flag = Arc::clone(&delivered);
    r.read(
        vec![0u8; 8],
        move |ior| {
            flag.store(true, Ordering::SeqCst);
            tx.send(ior).unwrap();
            false
        },
        None,
    )
    .unwrap();

    // Give the reactor time to arm the descriptor.
    std::thread::sleep(Duration::from_millis(50));

    r.cancel(true, true, false);
    // The non-fast cancel returns only after the callback has run.
    assert!(delivered.load(Ordering::SeqCst));

    let ior = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(ior.is_canceled(), "expected ECANCELED, got {:?}", ior.result);
}

#[test]
fn close_mid_flight_cancels_both_directions() {
    let handler = start_handler();

    let (local, peer) = UnixStream::pair().unwrap();
    local.set_nonblocking(true).unwrap();

    // Fill the kernel send buffer so a queued write cannot complete.
    let mut filler = local.try_clone().unwrap();
    while filler.write(&[b'x'; 65536]).is_ok() {}

    let conn = Arc::new(FdConnection::new(
        handler.handle(),
        local.into_raw_fd(),
        false,
    ));

    let (tx, rx) = mpsc::channel();
    let tx2 = tx.clone();
    conn.read(
        vec![0u8; 8],
        move |ior| {
            tx.send(("read", ior.is_canceled())).unwrap();
            false
        },
        None,
    )
    .unwrap();
    conn.write(
        vec![b'y'; 1024],
        move |ior| {
            tx2.send(("write", ior.is_canceled())).unwrap();
            false
        },
        None,
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));

    conn.close();

    let mut results = vec![
        rx.recv_timeout(RECV_TIMEOUT).unwrap(),
        rx.recv_timeout(RECV_TIMEOUT).unwrap(),
    ];
    results.sort();
    assert_eq!(results, vec![("read", true), ("write", true)]);
    // Closed exactly once; the descriptor slot is gone.
    assert_eq!(conn.handle(), -1);

    peer.shutdown(Shutdown::Both).unwrap();
}

#[test]
fn cancel_after_completion_is_a_noop() {
    let handler = start_handler();
    let (r, w) = pipe(&handler.handle()).unwrap();
    let (r, w) = (Arc::new(r), Arc::new(w));

    let (tx, rx) = mpsc::channel();
    r.read(
        vec![0u8; 8],
        move |ior| {
            tx.send(ior.result.map_err(|e| e.kind())).unwrap();
            false
        },
        None,
    )
    .unwrap();
    w.write_blocking(b"ok".to_vec(), None).unwrap();
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Ok(2));

    r.cancel(true, true, false);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn cancel_from_inside_a_callback() {
    let handler = start_handler();
    let (r, w) = pipe(&handler.handle()).unwrap();
    let (r, w) = (Arc::new(r), Arc::new(w));

    let (tx, rx) = mpsc::channel();
    let tx1 = tx.clone();
    let r2 = Arc::clone(&r);
    r.read(
        vec![0u8; 2],
        move |ior| {
            tx1.send(("first", ior.is_canceled())).unwrap();
            // Retract the second read; same-thread cancellation applies
            // inline, so its callback runs before this one returns control.
            r2.cancel(true, false, false);
            true
        },
        None,
    )
    .unwrap();
    r.read(
        vec![0u8; 2],
        move |ior| {
            tx.send(("second", ior.is_canceled())).unwrap();
            false
        },
        None,
    )
    .unwrap();

    w.write_blocking(b"zz".to_vec(), None).unwrap();

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), ("first", false));
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), ("second", true));
}
