//! A handful of timers multiplexed over one timer descriptor.
//!
//! Two repeating tickers and a one-shot share a `TimerSet`; the faster
//! ticker cancels itself from its own callback after five rounds.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use iomux::{IoHandler, TimerSet};

fn main() -> io::Result<()> {
    env_logger::init();

    let handler = IoHandler::new()?;
    handler.run(true)?;

    let timers = TimerSet::new(&handler.handle())?;

    let fast_ticks = AtomicU32::new(0);
    timers.set(
        Duration::from_millis(100),
        Some(Duration::from_millis(100)),
        move |set, id| {
            let n = fast_ticks.fetch_add(1, Ordering::Relaxed) + 1;
            println!("fast tick {}", n);
            if n == 5 {
                println!("fast ticker bowing out");
                set.cancel(id);
            }
        },
    )?;

    timers.set(
        Duration::from_millis(250),
        Some(Duration::from_millis(250)),
        |_, _| println!("slow tick"),
    )?;

    timers.set(Duration::from_millis(900), None, |_, _| {
        println!("one-shot, almost done")
    })?;

    std::thread::sleep(Duration::from_millis(1100));

    timers.clear();
    handler.stop();
    handler.join();
    Ok(())
}
