//! A TCP echo server.
//!
//! Every accepted client gets a read queued with a one-minute timeout;
//! whatever arrives is written back, with short writes resubmitted until the
//! whole chunk is out. Try it with `nc 127.0.0.1 9000`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use iomux::{Connection, ConnectionExt, IoHandler, TcpConnection, TcpListener};

const LISTEN_ADDR: &str = "127.0.0.1:9000";
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

fn main() -> io::Result<()> {
    env_logger::init();

    let handler = IoHandler::new()?;
    handler.run(true)?;

    let listener = Arc::new(TcpListener::bind(
        &handler.handle(),
        LISTEN_ADDR.parse().unwrap(),
    )?);
    println!("echo server listening on {}", listener.local_addr());

    accept_next(&listener);

    // Serve until killed.
    handler.join();
    Ok(())
}

fn accept_next(listener: &Arc<TcpListener>) {
    let l = Arc::clone(listener);
    let result = listener.wait_readable(
        move |_| {
            loop {
                match l.accept() {
                    Ok((client, peer)) => {
                        println!("client {} connected", peer);
                        read_more(Arc::new(client));
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        eprintln!("accept failed: {}", e);
                        break;
                    }
                }
            }
            accept_next(&l);
            false
        },
        None,
    );
    if let Err(e) = result {
        eprintln!("cannot accept further clients: {}", e);
    }
}

fn read_more(client: Arc<TcpConnection>) {
    let c = Arc::clone(&client);
    let result = client.read(
        vec![0u8; 2048],
        move |mut ior| {
            match ior.result {
                Ok(0) => {
                    println!("client disconnected");
                    c.close();
                }
                Ok(n) => {
                    ior.buf.truncate(n);
                    echo_back(&c, ior.buf);
                }
                Err(ref e) => {
                    if ior.is_timed_out() {
                        println!("client idle, hanging up");
                    } else {
                        eprintln!("read failed: {}", e);
                    }
                    c.close();
                }
            }
            false
        },
        Some(CLIENT_TIMEOUT),
    );
    if result.is_err() {
        client.close();
    }
}

fn echo_back(client: &Arc<TcpConnection>, data: Vec<u8>) {
    let c = Arc::clone(client);
    let result = client.write(
        data,
        move |mut ior| {
            match ior.result {
                Ok(n) if n < ior.size => {
                    // Short write: push the tail before reading again.
                    let tail = ior.buf.split_off(n);
                    echo_back(&c, tail);
                }
                Ok(_) => read_more(Arc::clone(&c)),
                Err(e) => {
                    eprintln!("write failed: {}", e);
                    c.close();
                }
            }
            false
        },
        None,
    );
    if result.is_err() {
        client.close();
    }
}
