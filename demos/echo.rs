//! Generation-counting echo server.
//!
//! ```sh
//! cargo run --example echo
//! # elsewhere:
//! nc 127.0.0.1 7070        # greeted by generation 0
//! kill -HUP <printed pid>  # swap the binary in place
//! nc 127.0.0.1 7070        # greeted by generation 1, same socket
//! ```

use std::{
    env,
    io::{Read, Write},
    process,
    sync::Arc,
    thread,
    time::Duration,
};

use instar::{Options, Upgrader};

fn main() {
    let generation: u32 = env::var("ECHO_GENERATION")
        .ok()
        .and_then(|g| g.parse().ok())
        .unwrap_or(0);

    // SIGHUP triggers the upgrade. Block it process-wide before spawning
    // anything so the dedicated thread below is the only receiver.
    let mut hup = nix::sys::signal::SigSet::empty();
    hup.add(nix::sys::signal::Signal::SIGHUP);
    hup.thread_block().expect("can't block SIGHUP");

    let upgrader = Arc::new(Upgrader::new(Options::default()).expect("can't set up upgrader"));

    let listener = upgrader
        .listen_tcp("tcp", "127.0.0.1:7070")
        .expect("can't listen on 127.0.0.1:7070");

    // The successor picks this up from its environment. Set before any
    // upgrade can fork and before the handler thread exists.
    unsafe { env::set_var("ECHO_GENERATION", (generation + 1).to_string()) };

    {
        let upgrader = upgrader.clone();
        thread::spawn(move || loop {
            if hup.wait().is_ok() {
                if let Err(e) = upgrader.upgrade() {
                    eprintln!("upgrade failed, still serving: {e}");
                }
            }
        });
    }

    upgrader.ready().expect("can't declare readiness");
    println!(
        "generation {generation} serving on 127.0.0.1:7070, pid {} (SIGHUP to upgrade)",
        process::id()
    );

    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { break };
            thread::spawn(move || {
                let _ = writeln!(conn, "hello from generation {generation}");
                let mut buf = [0u8; 1024];
                while let Ok(n) = conn.read(&mut buf) {
                    if n == 0 || conn.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            });
        }
    });

    upgrader.exit().wait();
    println!("generation {generation} replaced, draining");
    thread::sleep(Duration::from_millis(200));
    process::exit(0);
}
