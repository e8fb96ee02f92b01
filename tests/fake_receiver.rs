//! End-to-end tests against a scripted receiver on a loopback socket

use avr_control::{AvrClient, ClientConfig, ErrorPolicy, StateUpdate, Zone, ZoneSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

/// Receiver with a main zone and zone 2; zone 3 and HDZone never answer
struct Device {
    power: bool,
    volume: u16,
    mute: bool,
    source: String,
    zone2_power: bool,
    zone2_volume: u16,
    zone2_source: String,
    /// Leave the main zone power query unanswered
    main_absent: bool,
    /// Close connection number `n` (from 1) when it sees a power query
    hang_up_on: Option<usize>,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            power: false,
            volume: 80,
            mute: false,
            source: "04".to_string(),
            zone2_power: false,
            zone2_volume: 30,
            zone2_source: "01".to_string(),
            main_absent: false,
            hang_up_on: None,
        }
    }
}

fn flag(value: bool) -> u8 {
    if value {
        0
    } else {
        1
    }
}

impl Device {
    fn respond(&mut self, line: &str) -> Option<String> {
        let reply = match line {
            "?P" if self.main_absent => return None,
            "?P" => format!("PWR{}", flag(self.power)),
            "PO" => {
                self.power = true;
                format!("PWR{}", flag(self.power))
            }
            "PF" => {
                self.power = false;
                format!("PWR{}", flag(self.power))
            }
            "?V" => format!("VOL{:03}", self.volume),
            "VU" => {
                self.volume += 1;
                format!("VOL{:03}", self.volume)
            }
            "VD" => {
                self.volume -= 1;
                format!("VOL{:03}", self.volume)
            }
            "?M" => format!("MUT{}", flag(self.mute)),
            "MO" => {
                self.mute = true;
                format!("MUT{}", flag(self.mute))
            }
            "MF" => {
                self.mute = false;
                format!("MUT{}", flag(self.mute))
            }
            "?F" => format!("FN{}", self.source),
            "?AP" => format!("APR{}", flag(self.zone2_power)),
            "APO" => {
                self.zone2_power = true;
                format!("APR{}", flag(self.zone2_power))
            }
            "?ZV" => format!("ZV{:02}", self.zone2_volume),
            "?Z2M" => "Z2MUT1".to_string(),
            "?ZS" => format!("Z2F{}", self.zone2_source),
            "?RGD" => "RGD<123><VSX-930>".to_string(),
            "?SSI" => "SSI\"1.021\"".to_string(),
            "?SVB" => "SVB0009B0AABBCC".to_string(),
            "?RGB01" => "RGB011CD".to_string(),
            "?RGB04" => "RGB041DVD".to_string(),
            "?RGB05" => "RGB051TV".to_string(),
            "?RGB06" => "RGB060HIDDEN".to_string(),
            line if line.starts_with("?RGB") => "E06".to_string(),
            line if line.ends_with("VL") => {
                self.volume = line.trim_end_matches("VL").parse().ok()?;
                format!("VOL{:03}", self.volume)
            }
            line if line.ends_with("FN") => {
                self.source = line.trim_end_matches("FN").to_string();
                format!("FN{}", self.source)
            }
            line if line.ends_with("ZS") && line.len() == 4 => {
                self.zone2_source = line[..2].to_string();
                format!("Z2F{}", self.zone2_source)
            }
            line if line.ends_with("ZV") && line.len() == 4 => {
                self.zone2_volume = line[..2].parse().ok()?;
                format!("ZV{:02}", self.zone2_volume)
            }
            _ => return None,
        };
        Some(reply)
    }
}

struct FakeReceiver {
    port: u16,
    device: Arc<Mutex<Device>>,
    received: Arc<Mutex<Vec<String>>>,
    drop_tx: watch::Sender<u64>,
    connections: Arc<AtomicUsize>,
}

impl FakeReceiver {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let device = Arc::new(Mutex::new(Device::default()));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (drop_tx, drop_rx) = watch::channel(0);
        let connections = Arc::new(AtomicUsize::new(0));

        let (d, r, c) = (device.clone(), received.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = c.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(serve(stream, index, d.clone(), r.clone(), drop_rx.clone()));
            }
        });

        Self {
            port,
            device,
            received,
            drop_tx,
            connections,
        }
    }

    fn config(&self) -> ClientConfig {
        ClientConfig::new("127.0.0.1", self.port)
            .with_timeout(Duration::from_millis(200))
            .with_command_delay(Duration::from_millis(5))
    }

    /// Close every open connection from the receiver side
    fn drop_connections(&self) {
        self.drop_tx.send_modify(|generation| *generation += 1);
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

async fn serve(
    stream: TcpStream,
    index: usize,
    device: Arc<Mutex<Device>>,
    received: Arc<Mutex<Vec<String>>>,
    mut drop_rx: watch::Receiver<u64>,
) {
    drop_rx.borrow_and_update();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    loop {
        let mut buf = Vec::new();
        tokio::select! {
            read = reader.read_until(b'\r', &mut buf) => {
                if !matches!(read, Ok(n) if n > 0) {
                    return;
                }
                let line = String::from_utf8_lossy(&buf).trim_end_matches('\r').to_string();
                received.lock().unwrap().push(line.clone());
                let reply = {
                    let mut device = device.lock().unwrap();
                    if line == "?P" && device.hang_up_on == Some(index) {
                        return;
                    }
                    device.respond(&line)
                };
                if let Some(reply) = reply {
                    if write.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
            _ = drop_rx.changed() => return,
        }
    }
}

async fn wait_for(condition: impl Fn() -> bool, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

async fn connected_client(receiver: &FakeReceiver) -> AvrClient {
    let client = AvrClient::new(receiver.config()).unwrap();
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn discovers_zones_sources_and_device_info() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;

    let zones = client.query_zones().await.unwrap();
    assert_eq!(zones, ZoneSet::from([Zone::Main, Zone::Zone2]));
    assert_eq!(client.max_volume(Zone::Main), 185);
    assert_eq!(client.max_volume(Zone::Zone2), 81);

    client.build_source_dict().await.unwrap();
    assert_eq!(client.source_names(), vec!["CD", "DVD", "TV"]);

    let info = client.query_device_info().await.unwrap();
    assert_eq!(info.model, "VSX-930");
    assert_eq!(info.software_version, "1.021");
    assert_eq!(info.mac_address, "00:09:b0:aa:bb:cc");

    client.shutdown().await;
}

#[tokio::test]
async fn supplied_sources_skip_discovery() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;
    client.set_source_dict(BTreeMap::from([("Game".to_string(), "49".to_string())]));

    client.build_source_dict().await.unwrap();
    assert!(!receiver.received().iter().any(|line| line.starts_with("?RGB")));
    assert_eq!(client.source_names(), vec!["Game"]);

    client.shutdown().await;
}

#[tokio::test]
async fn full_refresh_fires_every_zone_once() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;
    client.query_zones().await.unwrap();
    client.build_source_dict().await.unwrap();
    assert!(client.update(true).await.unwrap());

    assert_eq!(client.power(Zone::Main), Some(false));
    assert_eq!(client.volume(Zone::Main), Some(80));
    assert_eq!(client.mute(Zone::Main), Some(false));
    assert_eq!(client.source(Zone::Main).as_deref(), Some("DVD"));
    assert_eq!(client.source(Zone::Zone2).as_deref(), Some("CD"));
    assert_eq!(client.volume(Zone::Zone2), Some(30));

    let counts: Arc<Mutex<BTreeMap<Zone, usize>>> = Arc::default();
    for zone in Zone::ALL {
        let counts = counts.clone();
        client.set_zone_callback(zone, move |zone| {
            *counts.lock().unwrap().entry(zone).or_default() += 1;
        });
    }
    let refreshes = Arc::new(AtomicUsize::new(0));
    let r = refreshes.clone();
    client.set_update_callback(move || {
        r.fetch_add(1, Ordering::SeqCst);
    });

    // Nothing changed on the receiver, yet every discovered zone is reported
    assert!(client.update(true).await.unwrap());
    let counts = counts.lock().unwrap().clone();
    assert_eq!(counts, BTreeMap::from([(Zone::Main, 1), (Zone::Zone2, 1)]));
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn scheduled_refresh_is_skipped_while_traffic_flows() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;
    assert!(client.update(true).await.unwrap());
    // Traffic just happened and the scan interval is a minute
    assert!(!client.update(false).await.unwrap());
    client.shutdown().await;
}

#[tokio::test]
async fn commands_update_cache_and_fire_only_changed_zones() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;
    client.query_zones().await.unwrap();
    client.update(true).await.unwrap();

    let changed = Arc::new(Mutex::new(Vec::new()));
    for zone in Zone::ALL {
        let changed = changed.clone();
        client.set_zone_callback(zone, move |zone| changed.lock().unwrap().push(zone));
    }

    assert!(client.mute_on(Zone::Main).await.unwrap());
    assert_eq!(client.mute(Zone::Main), Some(true));
    assert_eq!(*changed.lock().unwrap(), vec![Zone::Main]);

    // Same value again: no callback
    assert!(client.mute_on(Zone::Main).await.unwrap());
    assert_eq!(changed.lock().unwrap().len(), 1);

    assert!(client.set_volume_level(Zone::Main, 120).await.unwrap());
    assert_eq!(client.volume(Zone::Main), Some(120));
    assert!(receiver.received().contains(&"120VL".to_string()));

    assert!(client.set_volume_level(Zone::Zone2, 7).await.unwrap());
    assert_eq!(client.volume(Zone::Zone2), Some(7));
    assert!(receiver.received().contains(&"07ZV".to_string()));

    assert!(client.set_volume_level(Zone::Zone2, 82).await.is_err());

    client.shutdown().await;
}

#[tokio::test]
async fn power_on_bounces_main_volume() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;
    client.update(true).await.unwrap();
    assert_eq!(client.power(Zone::Main), Some(false));

    assert!(client.turn_on(Zone::Main).await.unwrap());
    assert_eq!(client.power(Zone::Main), Some(true));

    let bounced = wait_for(
        || {
            let lines = receiver.received();
            let up = lines.iter().position(|l| l == "VU");
            let down = lines.iter().position(|l| l == "VD");
            matches!((up, down), (Some(u), Some(d)) if u < d)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(bounced);
    assert!(wait_for(|| client.volume(Zone::Main) == Some(80), Duration::from_secs(1)).await);

    client.shutdown().await;
}

#[tokio::test]
async fn unanswered_request_times_out_without_blocking() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;

    let start = Instant::now();
    let reply = client
        .send_raw_request("?ZEP", "ZEP", ErrorPolicy::Raise, true)
        .await
        .unwrap();
    assert_eq!(reply, None);
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(start.elapsed() < Duration::from_secs(2));

    let reply = client
        .send_raw_request("?P", "PWR", ErrorPolicy::Raise, true)
        .await
        .unwrap();
    assert_eq!(reply.as_deref(), Some("PWR1"));

    let rejected = client
        .send_raw_request("?RGB59", "RGB", ErrorPolicy::Raise, true)
        .await;
    assert!(matches!(rejected, Err(avr_control::AvrError::Device { .. })));

    client.shutdown().await;
}

#[tokio::test]
async fn concurrent_requests_get_their_own_answers() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;

    let (power, volume, mute) = tokio::join!(
        client.send_raw_request("?P", "PWR", ErrorPolicy::Raise, true),
        client.send_raw_request("?V", "VOL", ErrorPolicy::Raise, true),
        client.send_raw_request("?M", "MUT", ErrorPolicy::Raise, true),
    );
    assert_eq!(power.unwrap().as_deref(), Some("PWR1"));
    assert_eq!(volume.unwrap().as_deref(), Some("VOL080"));
    assert_eq!(mute.unwrap().as_deref(), Some("MUT1"));

    client.shutdown().await;
}

#[tokio::test]
async fn reconnects_after_receiver_drops_the_connection() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;
    client.update(true).await.unwrap();
    let mut updates = client.subscribe();
    assert_eq!(client.epoch(), 1);

    receiver.drop_connections();
    let lost = timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(StateUpdate::Availability(false)) = updates.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(lost.is_ok());
    assert!(!client.available());
    // Last known values survive the disconnect
    assert_eq!(client.volume(Zone::Main), Some(80));

    // First retry waits between 4 and 5 seconds
    receiver.device.lock().unwrap().volume = 95;
    assert!(wait_for(|| client.available(), Duration::from_secs(8)).await);
    assert_eq!(client.epoch(), 2);
    assert_eq!(receiver.connections.load(Ordering::SeqCst), 2);
    assert!(wait_for(|| client.volume(Zone::Main) == Some(95), Duration::from_secs(2)).await);

    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_reconnection() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;
    client.shutdown().await;
    assert!(!client.available());

    assert!(matches!(
        client.send_raw_command("?P", false).await,
        Err(avr_control::AvrError::NotConnected)
    ));
    sleep(Duration::from_millis(300)).await;
    assert_eq!(receiver.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = AvrClient::new(
        ClientConfig::new("127.0.0.1", port).with_timeout(Duration::from_millis(200)),
    )
    .unwrap();
    assert!(client.connect().await.is_err());
    assert!(!client.available());
}

#[tokio::test]
async fn second_connect_is_a_no_op() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;
    client.connect().await.unwrap();
    assert_eq!(client.epoch(), 1);
    assert_eq!(receiver.connections.load(Ordering::SeqCst), 1);
    client.shutdown().await;
}

#[tokio::test]
async fn missing_main_zone_fails_discovery() {
    let receiver = FakeReceiver::start().await;
    receiver.device.lock().unwrap().main_absent = true;
    let client = connected_client(&receiver).await;

    assert!(matches!(
        client.query_zones().await,
        Err(avr_control::AvrError::NoMainZone)
    ));
    assert!(client.zones().is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn select_source_on_secondary_zone() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;
    client.query_zones().await.unwrap();
    client.build_source_dict().await.unwrap();
    client.update(true).await.unwrap();
    assert_eq!(client.source(Zone::Zone2).as_deref(), Some("CD"));

    assert!(client.select_source(Zone::Zone2, "TV").await.unwrap());
    assert!(receiver.received().contains(&"05ZS".to_string()));
    assert_eq!(client.source(Zone::Zone2).as_deref(), Some("TV"));

    // A bare code works too
    assert!(client.select_source(Zone::Zone2, "04").await.unwrap());
    assert_eq!(client.source(Zone::Zone2).as_deref(), Some("DVD"));
    assert_eq!(client.source(Zone::Main).as_deref(), Some("DVD"));

    client.shutdown().await;
}

#[tokio::test]
async fn disconnect_fires_every_discovered_zone() {
    let receiver = FakeReceiver::start().await;
    let client = connected_client(&receiver).await;
    client.query_zones().await.unwrap();
    client.update(true).await.unwrap();

    let fired: Arc<Mutex<ZoneSet>> = Arc::default();
    for zone in Zone::ALL {
        let fired = fired.clone();
        client.set_zone_callback(zone, move |zone| {
            fired.lock().unwrap().insert(zone);
        });
    }

    receiver.drop_connections();
    assert!(wait_for(|| fired.lock().unwrap().len() == 2, Duration::from_secs(2)).await);
    assert_eq!(
        *fired.lock().unwrap(),
        ZoneSet::from([Zone::Main, Zone::Zone2])
    );
    assert!(!client.available());

    client.shutdown().await;
}

#[tokio::test]
async fn garbled_frames_do_not_end_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let device = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut garbage = vec![b'X'; 5000];
        garbage.extend_from_slice(b"\r\n");
        stream.write_all(b"RGB011Caf\xe9\r\n").await.unwrap();
        stream.write_all(&garbage).await.unwrap();
        stream.write_all(b"PWR0\r\n").await.unwrap();
        // Hold the connection open until the test is done
        sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let client = AvrClient::new(
        ClientConfig::new("127.0.0.1", port).with_timeout(Duration::from_millis(200)),
    )
    .unwrap();
    client.connect().await.unwrap();

    assert!(wait_for(|| client.power(Zone::Main) == Some(true), Duration::from_secs(2)).await);
    assert!(client.available());
    assert_eq!(client.epoch(), 1);

    client.shutdown().await;
    device.abort();
}

#[tokio::test]
async fn link_lost_during_refresh_after_reconnect_still_heals() {
    let receiver = FakeReceiver::start().await;
    receiver.device.lock().unwrap().hang_up_on = Some(2);
    let client = connected_client(&receiver).await;
    client.update(true).await.unwrap();

    receiver.drop_connections();
    assert!(wait_for(|| !client.available(), Duration::from_secs(2)).await);

    // Second session dies on its first refresh query, third one sticks
    assert!(
        wait_for(
            || receiver.connections.load(Ordering::SeqCst) >= 3 && client.available(),
            Duration::from_secs(16),
        )
        .await
    );
    assert!(wait_for(|| client.power(Zone::Main) == Some(false), Duration::from_secs(2)).await);

    client.shutdown().await;
}
