use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use iomux::{pipe, ConnectionExt};

mod util;

use util::start_handler;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn read_times_out_within_window() {
    let handler = start_handler();
    let (r, _w) = pipe(&handler.handle()).unwrap();
    let r = Arc::new(r);

    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    r.read(
        vec![0u8; 8],
        move |ior| {
            tx.send(ior).unwrap();
            false
        },
        Some(Duration::from_millis(50)),
    )
    .unwrap();

    let ior = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let elapsed = start.elapsed();
    assert!(ior.is_timed_out(), "expected ETIMEDOUT, got {:?}", ior.result);
    assert!(elapsed >= Duration::from_millis(50), "fired early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "fired late: {:?}", elapsed);
}

#[test]
fn timeouts_fire_in_deadline_order() {
    let handler = start_handler();
    let (r, _w) = pipe(&handler.handle()).unwrap();
    let r = Arc::new(r);

    let (tx, rx) = mpsc::channel();
    // Queued first but with the later deadline.
    let tx1 = tx.clone();
    r.read(
        vec![0u8; 8],
        move |ior| {
            tx1.send(("slow", ior.is_timed_out())).unwrap();
            false
        },
        Some(Duration::from_millis(150)),
    )
    .unwrap();
    r.read(
        vec![0u8; 8],
        move |ior| {
            tx.send(("fast", ior.is_timed_out())).unwrap();
            false
        },
        Some(Duration::from_millis(40)),
    )
    .unwrap();

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), ("fast", true));
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), ("slow", true));
}

#[test]
fn completed_operation_does_not_time_out() {
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
        Some(Duration::from_millis(60)),
    )
    .unwrap();

    w.write_blocking(b"now".to_vec(), None).unwrap();

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Ok(3));
    // Past the deadline the callback must not run a second time.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn write_timeout_on_full_pipe() {
    let handler = start_handler();
    let (_r, w) = pipe(&handler.handle()).unwrap();
    let w = Arc::new(w);

    // Stuff the pipe until the kernel buffer is full, then queue one more
    // write with a deadline.
    loop {
        let ior = w
            .write_blocking(vec![b'x'; 65536], Some(Duration::from_millis(40)))
            .unwrap();
        match ior.result {
            Ok(_) => continue,
            Err(ref e) => {
                assert!(ior.is_timed_out(), "unexpected error: {}", e);
                break;
            }
        }
    }
}
