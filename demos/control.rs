//! Poll a receiver once, then print broadcasts until Ctrl-C.
//!
//! ```text
//! cargo run --example control -- 192.168.1.100 [port]
//! ```

use arcam_avr::{ConnectionConfig, ConnectionState, Session, Zone, ZoneStatus};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().ok_or("usage: control <host> [port]")?;
    let port = match args.next() {
        Some(port) => port.parse()?,
        None => arcam_avr::DEFAULT_PORT,
    };

    let config = ConnectionConfig::new(host).with_port(port);
    let session = Arc::new(Session::open_with_config(config).await?);
    let zone = Zone::new(session.clone(), 1);

    match zone.software_version().await {
        Ok(version) => println!("Software version: {}", version),
        Err(e) => println!("Software version unavailable: {}", e),
    }

    let mut status = zone.status().await?;
    print_status(&status);

    let mut updates = session.subscribe();
    let mut state = session.watch_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Some(update) => {
                    if status.apply(&update) {
                        print_status(&status);
                    } else {
                        println!("Broadcast: {:?}", update);
                    }
                }
                None => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                println!("Connection: {:?}", current);
                if current == ConnectionState::Connected {
                    status = zone.status().await?;
                    print_status(&status);
                }
            }
        }
    }

    session.close().await;
    Ok(())
}

fn print_status(status: &ZoneStatus) {
    println!(
        "Zone {}: power={:?} volume={:?} muted={:?} source={:?}",
        status.zone, status.power, status.volume, status.muted, status.source
    );
}
