#[cfg(any(target_os = "linux", target_os = "android"))]
#[macro_use]
mod unix;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use self::unix::{current_tid, default_signal, event, ControlSignal, Events, Selector};

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("iomux requires epoll, timerfd and realtime signals (Linux or Android)");
