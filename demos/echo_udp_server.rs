//! A UDP echo server: every datagram is sent back where it came from.
//!
//! Try it with `nc -u 127.0.0.1 9001`.

use std::io;
use std::sync::Arc;

use iomux::{ConnectionExt, IoHandler, UdpConnection};

const LISTEN_ADDR: &str = "127.0.0.1:9001";

fn main() -> io::Result<()> {
    env_logger::init();

    let handler = IoHandler::new()?;
    handler.run(true)?;

    let sock = Arc::new(UdpConnection::bind(
        &handler.handle(),
        LISTEN_ADDR.parse().unwrap(),
    )?);
    println!("udp echo server on {}", sock.local_addr());

    recv_next(&sock);

    handler.join();
    Ok(())
}

fn recv_next(sock: &Arc<UdpConnection>) {
    let s = Arc::clone(sock);
    let result = sock.read_from(
        vec![0u8; 2048],
        move |mut ior| {
            match (ior.result, ior.peer) {
                (Ok(n), Some(peer)) => {
                    ior.buf.truncate(n);
                    let reply = s.write_to(ior.buf, peer, |_| false, None);
                    if let Err(e) = reply {
                        eprintln!("echo to {} failed: {}", peer, e);
                    }
                }
                (Ok(_), None) => {}
                (Err(e), _) => eprintln!("receive failed: {}", e),
            }
            recv_next(&s);
            false
        },
        None,
    );
    if let Err(e) = result {
        eprintln!("cannot receive further datagrams: {}", e);
    }
}
