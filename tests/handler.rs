use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use iomux::{pipe, ConnectionExt, Handle, IoHandler};

mod util;

use util::{assert_send, assert_sync, init, start_handler};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn is_send_and_sync() {
    assert_send::<IoHandler>();
    assert_sync::<IoHandler>();
    assert_send::<Handle>();
    assert_sync::<Handle>();
}

#[test]
fn run_twice_fails() {
    let handler = start_handler();
    let err = handler.run(true).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EALREADY));
}

#[test]
fn restarts_after_stop() {
    let handler = start_handler();
    handler.stop();
    handler.join();

    handler.run(true).expect("restart failed");
    let (r, w) = pipe(&handler.handle()).unwrap();
    let (r, w) = (Arc::new(r), Arc::new(w));
    w.write_blocking(b"hi".to_vec(), None).unwrap();
    let ior = r.read_blocking(vec![0u8; 8], None).unwrap();
    assert_eq!(ior.data(), b"hi");
}

#[test]
fn submit_on_stopped_reactor_fails() {
    init();
    let handler = IoHandler::new().unwrap();
    // Loop never started; pipe creation works but submission must fail.
    let (r, _w) = pipe(&handler.handle()).unwrap();
    let r = Arc::new(r);
    let err = r.read(vec![0u8; 8], |_| false, None).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ESHUTDOWN));
}

#[test]
fn submit_on_closed_connection_fails() {
    let handler = start_handler();
    let conn = Arc::new(iomux::FdConnection::new(handler.handle(), -1, true));
    let err = conn.read(vec![0u8; 8], |_| false, None).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
}

#[test]
fn same_thread_only_on_reactor_thread() {
    let handler = start_handler();
    assert!(!handler.same_thread());

    let (r, w) = pipe(&handler.handle()).unwrap();
    let (r, w) = (Arc::new(r), Arc::new(w));

    let (tx, rx) = mpsc::channel();
    let handle = handler.handle();
    r.read(
        vec![0u8; 8],
        move |_| {
            tx.send(handle.same_thread()).unwrap();
            false
        },
        None,
    )
    .unwrap();
    w.write_blocking(b"!".to_vec(), None).unwrap();

    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap());
}

#[test]
fn stopping_cancels_pending_operations() {
    let handler = start_handler();
    let (r, _w) = pipe(&handler.handle()).unwrap();
    let r = Arc::new(r);

    let (tx, rx) = mpsc::channel();
    r.read(
        vec![0u8; 8],
        move |ior| {
            tx.send(ior.is_canceled()).unwrap();
            false
        },
        None,
    )
    .unwrap();

    handler.stop();
    handler.join();

    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap());
}

#[test]
fn reactors_share_and_release_the_signal_handler() {
    init();
    // Two live reactors share one installation; dropping either must leave
    // the other functional, and a fresh reactor after both works too.
    let first = start_handler();
    {
        let second = IoHandler::new().unwrap();
        second.run(true).unwrap();
        drop(second);
    }

    let (r, w) = pipe(&first.handle()).unwrap();
    let (r, w) = (Arc::new(r), Arc::new(w));
    w.write_blocking(b"still alive".to_vec(), None).unwrap();
    let ior = r.read_blocking(vec![0u8; 32], None).unwrap();
    assert_eq!(ior.data(), b"still alive");
    drop(first);

    let third = start_handler();
    let (r, w) = pipe(&third.handle()).unwrap();
    let (r, w) = (Arc::new(r), Arc::new(w));
    w.write_blocking(b"fresh install".to_vec(), None).unwrap();
    let ior = r.read_blocking(vec![0u8; 32], None).unwrap();
    assert_eq!(ior.data(), b"fresh install");
}

#[test]
fn blocking_wrappers_refuse_the_reactor_thread() {
    let handler = start_handler();
    let (r, w) = pipe(&handler.handle()).unwrap();
    let (r, w) = (Arc::new(r), Arc::new(w));

    let (tx, rx) = mpsc::channel();
    let r2 = Arc::clone(&r);
    r.read(
        vec![0u8; 8],
        move |_| {
            // A blocking submission from a callback would deadlock the loop.
            tx.send(r2.read_blocking(vec![0u8; 8], None).is_err()).unwrap();
            false
        },
        None,
    )
    .unwrap();
    w.write_blocking(b"!".to_vec(), None).unwrap();

    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap());
}
