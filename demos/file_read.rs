//! Read a file through the reactor with the blocking wrappers and copy it
//! to stdout.
//!
//! Usage: `file_read <path>`

use std::io::{self, Write};
use std::sync::Arc;

use iomux::{ConnectionExt, FileConnection, IoHandler};

fn main() -> io::Result<()> {
    env_logger::init();

    let path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: file_read <path>");
            std::process::exit(1);
        }
    };

    let handler = IoHandler::new()?;
    handler.run(true)?;

    let file = Arc::new(FileConnection::open(&handler.handle(), &path)?);
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut buf = vec![0u8; 4096];
    loop {
        let ior = file.read_blocking(buf, None)?;
        match ior.result {
            Ok(0) => break,
            Ok(n) => out.write_all(&ior.buf[..n])?,
            Err(e) => return Err(e),
        }
        buf = ior.buf;
    }

    handler.stop();
    handler.join();
    Ok(())
}
