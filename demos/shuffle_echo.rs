//! Byte-mangling adapters over a pipe.
//!
//! The write end XORs outgoing bytes with a random key, the read end undoes
//! it; the plain bytes never travel through the pipe.

use std::io;
use std::sync::Arc;

use iomux::{Adapter, ConnectionExt, IoHandler};

fn main() -> io::Result<()> {
    env_logger::init();

    let handler = IoHandler::new()?;
    handler.run(true)?;

    let (r, w) = iomux::pipe(&handler.handle())?;

    let key: u8 = rand::random();
    println!("obfuscating with key {:#04x}", key);

    let garbled_w = Arc::new(Adapter::new(Arc::new(w)).with_write_transform(move |buf| {
        for b in buf {
            *b ^= key;
        }
    }));
    let clear_r = Arc::new(Adapter::new(Arc::new(r)).with_read_transform(move |buf| {
        for b in buf {
            *b ^= key;
        }
    }));

    let message = b"the quick brown fox".to_vec();
    garbled_w.write(message, |_| false, None)?;

    let ior = clear_r.read_blocking(vec![0u8; 64], None)?;
    println!(
        "round trip: {}",
        String::from_utf8_lossy(ior.data())
    );
    assert_eq!(ior.data(), b"the quick brown fox");

    handler.stop();
    handler.join();
    Ok(())
}
