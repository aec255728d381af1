// Not all functions are used by all tests.
#![allow(dead_code)]

use std::sync::Once;

use iomux::IoHandler;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    })
}

/// A reactor with the loop already running on a worker thread.
pub fn start_handler() -> IoHandler {
    init();

    let handler = IoHandler::new().expect("unable to create reactor");
    handler.run(true).expect("unable to start reactor");
    handler
}

pub fn assert_sync<T: Sync>() {}
pub fn assert_send<T: Send>() {}
