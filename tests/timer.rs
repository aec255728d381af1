use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use iomux::{TimerConnection, TimerSet};

mod util;

use util::start_handler;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn one_shot_timer_fires_once() {
    let handler = start_handler();
    let timer = TimerConnection::new(&handler.handle()).unwrap();

    let (tx, rx) = mpsc::channel();
    timer
        .set(Duration::from_millis(30), None, move || {
            tx.send(()).unwrap();
        })
        .unwrap();

    rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
}

#[test]
fn repeating_timer_keeps_firing() {
    let handler = start_handler();
    let timer = TimerConnection::new(&handler.handle()).unwrap();

    let count = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&count);
    timer
        .set(
            Duration::from_millis(20),
            Some(Duration::from_millis(20)),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(200));
    timer.cancel();

    assert!(
        count.load(Ordering::SeqCst) >= 5,
        "only {} expirations",
        count.load(Ordering::SeqCst)
    );
}

#[test]
fn cancel_inside_callback_stops_repeating_timer() {
    let handler = start_handler();
    let timer = TimerConnection::new(&handler.handle()).unwrap();

    let count = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&count);
    let t = Arc::clone(&timer);
    timer
        .set(
            Duration::from_millis(20),
            Some(Duration::from_millis(20)),
            move || {
                if c.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    t.cancel();
                }
            },
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(count.load(Ordering::SeqCst), 3);

    // And stays stopped.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn timer_set_fires_in_deadline_order() {
    let handler = start_handler();
    let timers = TimerSet::new(&handler.handle()).unwrap();

    let (tx, rx) = mpsc::channel();
    let tx1 = tx.clone();
    // Added first, expires second.
    timers
        .set(Duration::from_millis(80), None, move |_, _| {
            tx1.send("late").unwrap();
        })
        .unwrap();
    timers
        .set(Duration::from_millis(30), None, move |_, _| {
            tx.send("early").unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), "early");
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), "late");
    assert!(timers.is_empty());
}

#[test]
fn timer_set_cancel_prevents_expiry() {
    let handler = start_handler();
    let timers = TimerSet::new(&handler.handle()).unwrap();

    let (tx, rx) = mpsc::channel();
    let doomed = timers
        .set(Duration::from_millis(60), None, move |_, _| {
            panic!("cancelled entry fired");
        })
        .unwrap();
    timers
        .set(Duration::from_millis(90), None, move |_, id| {
            tx.send(id).unwrap();
        })
        .unwrap();

    timers.cancel(doomed);

    rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(timers.is_empty());
}

#[test]
fn timer_set_entry_cancels_itself() {
    let handler = start_handler();
    let timers = TimerSet::new(&handler.handle()).unwrap();

    let count = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&count);
    timers
        .set(
            Duration::from_millis(20),
            Some(Duration::from_millis(20)),
            move |set, id| {
                if c.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    set.cancel(id);
                }
            },
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert!(timers.is_empty());
}

#[test]
fn timer_set_clear_drops_everything() {
    let handler = start_handler();
    let timers = TimerSet::new(&handler.handle()).unwrap();

    timers
        .set(Duration::from_millis(40), None, |_, _| {
            panic!("cleared entry fired");
        })
        .unwrap();
    timers
        .set(
            Duration::from_millis(50),
            Some(Duration::from_millis(50)),
            |_, _| panic!("cleared entry fired"),
        )
        .unwrap();
    timers.clear();
    assert!(timers.is_empty());

    std::thread::sleep(Duration::from_millis(150));
}
