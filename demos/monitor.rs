//! Connect to a receiver and print every state change
//!
//! Usage: cargo run --example monitor -- <host> [port]
//!
//! Set `RUST_LOG=avr_control=debug` to see the wire traffic.

use avr_control::{AvrClient, ClientConfig, StateUpdate, DEFAULT_PORT};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().ok_or("usage: monitor <host> [port]")?;
    let port = match args.next() {
        Some(port) => port.parse()?,
        None => DEFAULT_PORT,
    };

    let client = AvrClient::new(ClientConfig::new(host, port))?;
    client.connect().await?;

    let zones = client.query_zones().await?;
    client.build_source_dict().await?;
    let info = client.query_device_info().await?;
    println!(
        "{} (software {}, MAC {})",
        info.model, info.software_version, info.mac_address
    );
    println!("Zones: {:?}", zones);
    println!("Sources: {}", client.source_names().join(", "));

    let mut updates = client.subscribe();
    client.update(true).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(StateUpdate::Zone(zone)) => {
                    let state = client.zone_state(zone);
                    println!(
                        "{:<10} power={:?} volume={:?}/{} mute={:?} source={:?}",
                        zone.to_string(),
                        state.power,
                        state.volume,
                        client.max_volume(zone),
                        state.mute,
                        state.source
                    );
                }
                Ok(StateUpdate::Availability(available)) => {
                    println!("Receiver {}", if available { "connected" } else { "unavailable" });
                }
                Ok(StateUpdate::Refreshed) => {}
                Err(e) => eprintln!("{}", e),
            },
        }
    }

    client.shutdown().await;
    Ok(())
}
