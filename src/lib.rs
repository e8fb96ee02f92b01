//! Rust library for controlling networked AV receivers
//!
//! This library provides an async client for receivers that speak a
//! line-oriented ASCII control protocol over TCP. It supports:
//!
//! - A persistent session with TCP keepalive and automatic reconnection
//! - Power, volume, mute and source control for up to four zones
//! - Zone and source discovery
//! - A local cache of receiver state kept current from every frame received
//! - Periodic refresh that backs off while the receiver is already chatty
//! - Per-zone callbacks and broadcast state subscriptions
//!
//! # Quick Start
//!
//! ```no_run
//! use avr_control::{AvrClient, ClientConfig, Zone};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = AvrClient::new(ClientConfig::new("192.168.1.60", 8102))?;
//!     client.connect().await?;
//!
//!     // Find out what the receiver has
//!     let zones = client.query_zones().await?;
//!     client.build_source_dict().await?;
//!     client.update(true).await?;
//!     println!("Zones: {:?}, sources: {:?}", zones, client.source_names());
//!
//!     // React to changes reported by the receiver
//!     client.set_zone_callback(Zone::Main, |zone| println!("{} changed", zone));
//!
//!     client.turn_on(Zone::Main).await?;
//!     client.set_volume_level(Zone::Main, 90).await?;
//!
//!     let mut updates = client.subscribe();
//!     if let Ok(update) = updates.recv().await {
//!         println!("State update: {:?}", update);
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Client**: connection lifecycle, commands, refresh scheduling
//! - **Connection**: socket I/O, rate limiting, request/response matching
//! - **Codec**: newline framing tolerant of malformed frames
//! - **Reconnect**: backoff and the reconnection supervisor
//! - **State**: response parser and cached receiver state
//! - **Protocol**: command table and wire conventions
//! - **Subscription**: callbacks and broadcast updates

mod client;
mod codec;
mod config;
mod connection;
mod error;
mod protocol;
mod reconnect;
mod sources;
mod state;
mod subscription;
mod task;
mod types;

// Public exports
pub use client::AvrClient;
pub use config::{ClientConfig, DEFAULT_PORT};
pub use error::{AvrError, Result};
pub use protocol::{lookup as lookup_command, Command, ErrorPolicy};
pub use reconnect::{backoff, MAX_BACKOFF_SECS};
pub use sources::{SourceRegistry, MAX_SOURCE_NUMBERS};
pub use state::DeviceState;
pub use subscription::{StateReceiver, StateUpdate, UpdateCallback, ZoneCallback};
pub use task::Epoch;
pub use types::{
    DeviceInfo, Volume, Zone, ZoneSet, ZoneState, MAX_VOLUME_MAIN, MAX_VOLUME_ZONE, UNKNOWN,
};
