use crate::config::ClientConfig;
use crate::connection::{Connection, FrameReader};
use crate::error::{AvrError, Result};
use crate::protocol::{self, source_prefix, volume_prefix, Command, ErrorPolicy, Request};
use crate::reconnect;
use crate::sources::{parse_source_frame, SourceRegistry, MAX_SOURCE_NUMBERS};
use crate::state::DeviceState;
use crate::subscription::{Dispatcher, StateReceiver};
use crate::task::{Epoch, EpochTask, TaskSlot};
use crate::types::{DeviceInfo, Volume, Zone, ZoneSet, ZoneState};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::Mutex;

/// Queries issued for every zone during a refresh
const ZONE_QUERIES: [&str; 4] = ["query_power", "query_volume", "query_mute", "query_source_id"];

/// Source table plus whether it came from the host rather than discovery
#[derive(Default)]
struct Sources {
    registry: SourceRegistry,
    supplied: bool,
}

struct Inner {
    config: ClientConfig,
    state: std::sync::Mutex<DeviceState>,
    sources: RwLock<Sources>,
    zones: RwLock<ZoneSet>,
    connection: RwLock<Option<Arc<Connection>>>,
    epoch: AtomicU64,
    reconnect: AtomicBool,
    /// Set once a full refresh has completed
    refreshed: AtomicBool,

    connecting: Mutex<()>,
    disconnecting: Mutex<()>,
    updating: Mutex<()>,

    listener: TaskSlot,
    updater: TaskSlot,
    bouncer: TaskSlot,
    reconnector: TaskSlot,

    dispatcher: Dispatcher,
}

/// Client for an AV receiver's line-based control protocol
///
/// The client keeps one TCP session open, caches the receiver's per-zone
/// state from every frame it reads, refreshes that state periodically and
/// reconnects with exponential backoff when the session drops. Cloning the
/// client is cheap; all clones share the same session.
#[derive(Clone)]
pub struct AvrClient {
    inner: Arc<Inner>,
}

/// Handle held by background tasks so they do not keep the client alive
#[derive(Clone)]
pub(crate) struct WeakClient(Weak<Inner>);

impl WeakClient {
    pub fn upgrade(&self) -> Option<AvrClient> {
        self.0.upgrade().map(|inner| AvrClient { inner })
    }
}

impl AvrClient {
    /// Create a client; no connection is made until [`connect`](Self::connect)
    ///
    /// # Example
    ///
    /// ```no_run
    /// use avr_control::{AvrClient, ClientConfig, Zone};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let client = AvrClient::new(ClientConfig::new("192.168.1.60", 8102))?;
    ///     client.connect().await?;
    ///     client.query_zones().await?;
    ///     client.build_source_dict().await?;
    ///     client.update(true).await?;
    ///     client.set_volume_level(Zone::Main, 80).await?;
    ///     client.shutdown().await;
    ///     Ok(())
    /// }
    /// ```
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let sources = match &config.sources {
            Some(registry) => Sources {
                registry: registry.clone(),
                supplied: true,
            },
            None => Sources::default(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: std::sync::Mutex::new(DeviceState::new()),
                sources: RwLock::new(sources),
                zones: RwLock::new(ZoneSet::new()),
                connection: RwLock::new(None),
                epoch: AtomicU64::new(0),
                reconnect: AtomicBool::new(true),
                refreshed: AtomicBool::new(false),
                connecting: Mutex::new(()),
                disconnecting: Mutex::new(()),
                updating: Mutex::new(()),
                listener: TaskSlot::default(),
                updater: TaskSlot::default(),
                bouncer: TaskSlot::default(),
                reconnector: TaskSlot::default(),
                dispatcher: Dispatcher::new(),
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> WeakClient {
        WeakClient(Arc::downgrade(&self.inner))
    }

    /// `host:port` of the receiver
    pub fn address(&self) -> String {
        self.inner.config.address()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ========== Connection lifecycle ==========

    /// Open the session and start the listener and update tasks
    ///
    /// Does nothing (with a warning) if already connected or if another
    /// connect is in progress.
    pub async fn connect(&self) -> Result<()> {
        let Ok(_guard) = self.inner.connecting.try_lock() else {
            tracing::warn!("Connect to {} already in progress", self.address());
            return Ok(());
        };
        if self.available() {
            tracing::warn!("Already connected to {}", self.address());
            return Ok(());
        }

        let (connection, reader) = Connection::open(&self.inner.config).await?;
        let connection = Arc::new(connection);
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        *self.inner.connection.write().unwrap() = Some(connection.clone());
        self.inner.state.lock().unwrap().available = true;
        self.inner.dispatcher.notify_availability(true);

        let listener = EpochTask::spawn(
            "listener",
            epoch,
            listen(self.downgrade(), connection, reader, epoch),
        );
        if let Some(stale) = self.inner.listener.replace(listener) {
            stale.cancel().await;
        }
        let updater = EpochTask::spawn("updater", epoch, run_updater(self.downgrade(), epoch));
        if let Some(stale) = self.inner.updater.replace(updater) {
            stale.cancel().await;
        }

        tracing::info!("Session to {} established (epoch {})", self.address(), epoch);
        Ok(())
    }

    /// Close the session
    ///
    /// Marks the client unavailable, fires every zone callback, stops the
    /// tasks of the current epoch and, unless shutting down, schedules
    /// reconnection. Does nothing if not connected.
    pub async fn disconnect(&self) {
        let Ok(_guard) = self.inner.disconnecting.try_lock() else {
            tracing::debug!("Disconnect already in progress");
            return;
        };
        let Some(connection) = self.inner.connection.write().unwrap().take() else {
            tracing::debug!("Not connected, nothing to disconnect");
            return;
        };
        let epoch = self.epoch();
        tracing::info!("Disconnecting from {} (epoch {})", self.address(), epoch);

        self.inner.state.lock().unwrap().available = false;
        self.inner.dispatcher.notify_availability(false);
        self.inner.dispatcher.notify_zones(self.refresh_zones());

        self.inner.listener.cancel_for(epoch).await;
        self.inner.updater.cancel_for(epoch).await;
        self.inner.bouncer.cancel_for(epoch).await;
        connection.close().await;

        if self.reconnect_enabled() {
            self.schedule_reconnect();
        }
    }

    /// Stop reconnecting and close the session for good
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down client for {}", self.address());
        self.inner.reconnect.store(false, Ordering::SeqCst);
        if let Some(task) = self.inner.reconnector.take() {
            task.cancel().await;
        }
        self.disconnect().await;
    }

    pub(crate) fn reconnect_enabled(&self) -> bool {
        self.inner.reconnect.load(Ordering::SeqCst)
    }

    /// Start a supervisor for the session that just dropped
    ///
    /// A supervisor started for an earlier session has already connected and
    /// may be about to exit, so it is replaced rather than relied on.
    fn schedule_reconnect(&self) {
        let epoch = self.epoch();
        if self.inner.reconnector.is_running_for(epoch) {
            tracing::debug!("Reconnection already scheduled");
            return;
        }
        let task = EpochTask::spawn("reconnector", epoch, reconnect::run(self.downgrade()));
        if let Some(previous) = self.inner.reconnector.replace(task) {
            tokio::spawn(previous.cancel());
        }
    }

    /// Disconnect from a task that may itself be cancelled by the disconnect
    fn spawn_disconnect(&self) {
        let client = self.clone();
        tokio::spawn(async move { client.disconnect().await });
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.inner
            .connection
            .read()
            .unwrap()
            .clone()
            .ok_or(AvrError::NotConnected)
    }

    // ========== Listener ==========

    /// Apply one frame to the cache, wake pending requests, fire callbacks
    fn handle_frame(&self, connection: &Connection, frame: String, epoch: Epoch) {
        let (changed, powered_on) = {
            let sources = self.inner.sources.read().unwrap();
            let mut state = self.inner.state.lock().unwrap();
            let was_on = state.power(Zone::Main);
            let changed = state.apply_response(&frame, &sources.registry);
            state.apply_info(&frame);
            let powered_on = was_on == Some(false) && state.power(Zone::Main) == Some(true);
            (changed, powered_on)
        };

        if powered_on && self.inner.config.volume_workaround {
            self.schedule_bounce(epoch);
        }
        self.inner.dispatcher.notify_zones(changed);

        // Callbacks for a frame run before the request it answers resumes
        connection.publish(frame);
    }

    /// Volume up then down so the receiver reports the main zone volume,
    /// which it omits after powering on
    fn schedule_bounce(&self, epoch: Epoch) {
        let weak = self.downgrade();
        let task = EpochTask::spawn("bouncer", epoch, async move {
            let Some(client) = weak.upgrade() else {
                return;
            };
            if client.epoch() != epoch {
                return;
            }
            tracing::debug!("Bouncing main zone volume");
            if let Err(e) = client.volume_up(Zone::Main).await {
                tracing::warn!("Volume bounce failed: {}", e);
                return;
            }
            if let Err(e) = client.volume_down(Zone::Main).await {
                tracing::warn!("Volume bounce failed: {}", e);
            }
        });
        if let Some(previous) = self.inner.bouncer.replace(task) {
            tokio::spawn(previous.cancel());
        }
    }

    // ========== Requests and commands ==========

    /// Write a raw command line without waiting for a reply
    pub async fn send_raw_command(&self, line: &str, rate_limited: bool) -> Result<()> {
        self.connection()?.send_raw_command(line, rate_limited).await
    }

    /// Write a raw command line and wait for a frame starting with
    /// `expected_prefix`
    ///
    /// Returns `Ok(None)` on timeout or on a device error the policy swallows.
    pub async fn send_raw_request(
        &self,
        line: &str,
        expected_prefix: &str,
        policy: ErrorPolicy,
        rate_limited: bool,
    ) -> Result<Option<String>> {
        let request = Request::new(line, expected_prefix).with_policy(policy);
        self.connection()?.send_raw_request(&request, rate_limited).await
    }

    /// Send a command from the command table
    ///
    /// `prefix` is prepended to the command code (volume level, source code).
    /// Request entries return the answering frame; plain entries return the
    /// line that was written. A command that does not exist for `zone` is
    /// logged and returns `Ok(None)`.
    pub async fn send_command(
        &self,
        name: &str,
        zone: Zone,
        prefix: &str,
        policy: ErrorPolicy,
        rate_limited: bool,
    ) -> Result<Option<String>> {
        match protocol::lookup(name, zone) {
            Some(Command::Send(code)) => {
                let line = format!("{}{}", prefix, code);
                self.send_raw_command(&line, rate_limited).await?;
                Ok(Some(line))
            }
            Some(Command::Request { code, response }) => {
                let line = format!("{}{}", prefix, code);
                self.send_raw_request(&line, response, policy, rate_limited)
                    .await
            }
            None => {
                tracing::warn!("Command {} is not available for {}", name, zone);
                Ok(None)
            }
        }
    }

    /// Zone command whose failure is reported as `false`
    async fn zone_command(&self, name: &str, zone: Zone, prefix: &str) -> Result<bool> {
        match self
            .send_command(name, zone, prefix, ErrorPolicy::Log, true)
            .await
        {
            Ok(reply) => Ok(reply.is_some()),
            Err(AvrError::NotConnected) => {
                tracing::warn!("Cannot {} {}: not connected", name, zone);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn turn_on(&self, zone: Zone) -> Result<bool> {
        self.zone_command("turn_on", zone, "").await
    }

    pub async fn turn_off(&self, zone: Zone) -> Result<bool> {
        self.zone_command("turn_off", zone, "").await
    }

    /// Select a source by name, or by its two-digit code
    pub async fn select_source(&self, zone: Zone, source: &str) -> Result<bool> {
        let code = {
            let sources = self.inner.sources.read().unwrap();
            match sources.registry.code(source) {
                Some(code) => code.to_string(),
                None if source.len() == 2 && source.chars().all(|c| c.is_ascii_digit()) => {
                    source.to_string()
                }
                None => return Err(AvrError::UnknownSource(source.to_string())),
            }
        };
        self.zone_command("select_source", zone, &code).await
    }

    pub async fn volume_up(&self, zone: Zone) -> Result<bool> {
        self.zone_command("volume_up", zone, "").await
    }

    pub async fn volume_down(&self, zone: Zone) -> Result<bool> {
        self.zone_command("volume_down", zone, "").await
    }

    /// Set an absolute volume
    ///
    /// The main zone accepts 0 to 185, the other zones 0 to 81.
    pub async fn set_volume_level(&self, zone: Zone, volume: i32) -> Result<bool> {
        let volume = validate_volume(zone, volume)?;
        self.zone_command("set_volume_level", zone, &volume_prefix(zone, volume))
            .await
    }

    pub async fn mute_on(&self, zone: Zone) -> Result<bool> {
        self.zone_command("mute_on", zone, "").await
    }

    pub async fn mute_off(&self, zone: Zone) -> Result<bool> {
        self.zone_command("mute_off", zone, "").await
    }

    // ========== Discovery ==========

    /// Probe which zones the receiver has
    ///
    /// A zone answering its power query, even with an error, is present; a
    /// zone that stays silent is absent. The main zone must be present.
    pub async fn query_zones(&self) -> Result<ZoneSet> {
        let mut zones = ZoneSet::new();
        for zone in Zone::ALL {
            let present = match self
                .send_command("query_power", zone, "", ErrorPolicy::Raise, true)
                .await
            {
                Ok(Some(_)) | Err(AvrError::Device { .. }) => true,
                Ok(None) => false,
                Err(e) => return Err(e),
            };
            if present {
                tracing::info!("{} discovered", zone);
                zones.insert(zone);
            } else if zone == Zone::Main {
                return Err(AvrError::NoMainZone);
            }
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            for zone in &zones {
                state.max_volume.insert(*zone, zone.max_volume());
            }
        }
        *self.inner.zones.write().unwrap() = zones.clone();
        Ok(zones)
    }

    /// Query model, software version and MAC address
    ///
    /// Fields the receiver does not report stay `"unknown"`.
    pub async fn query_device_info(&self) -> Result<DeviceInfo> {
        for query in ["query_model", "query_software_version", "query_mac_address"] {
            self.send_command(query, Zone::Main, "", ErrorPolicy::Ignore, true)
                .await?;
        }
        Ok(self.device_info())
    }

    /// Probe the receiver for its source names
    ///
    /// Skipped when a source table was supplied by configuration or
    /// [`set_source_dict`](Self::set_source_dict).
    pub async fn build_source_dict(&self) -> Result<()> {
        if self.inner.sources.read().unwrap().supplied {
            tracing::debug!("Source table supplied, skipping source discovery");
            return Ok(());
        }

        let mut registry = SourceRegistry::new();
        for number in 0..MAX_SOURCE_NUMBERS {
            let code = source_prefix(number);
            let reply = self
                .send_raw_request(&format!("?RGB{}", code), "RGB", ErrorPolicy::Ignore, true)
                .await?;
            match reply.as_deref().and_then(parse_source_frame) {
                Some(entry) if entry.active && entry.code == code => {
                    tracing::debug!("Source {} = {}", entry.code, entry.name);
                    registry.insert(entry.name, entry.code);
                }
                _ => {}
            }
        }

        tracing::info!("Discovered {} sources", registry.len());
        *self.inner.sources.write().unwrap() = Sources {
            registry,
            supplied: false,
        };
        Ok(())
    }

    /// Replace the source table with one supplied by the host
    pub fn set_source_dict(&self, sources: BTreeMap<String, String>) {
        *self.inner.sources.write().unwrap() = Sources {
            registry: SourceRegistry::from(sources),
            supplied: true,
        };
    }

    /// Name to code source table
    pub fn source_dict(&self) -> BTreeMap<String, String> {
        self.inner.sources.read().unwrap().registry.to_map()
    }

    /// Sorted source names
    pub fn source_names(&self) -> Vec<String> {
        self.inner.sources.read().unwrap().registry.names()
    }

    // ========== Refresh ==========

    /// Refresh the cached state from the receiver
    ///
    /// Returns `Ok(false)` when skipped: another refresh is running, the
    /// client is not connected, or (unless `full`) there was traffic within
    /// the scan interval. The first refresh is always full. After a full
    /// refresh every zone callback fires once. A query that goes unanswered
    /// means the link is dead: the client disconnects and `Timeout` is
    /// returned.
    pub async fn update(&self, full: bool) -> Result<bool> {
        let Ok(_guard) = self.inner.updating.try_lock() else {
            tracing::debug!("Refresh already in progress");
            return Ok(false);
        };
        let Ok(connection) = self.connection() else {
            tracing::debug!("Skipping refresh, not connected");
            return Ok(false);
        };
        let full = full || !self.inner.refreshed.load(Ordering::SeqCst);
        if !full && connection.idle_for() < self.inner.config.scan_interval {
            tracing::debug!("Skipping refresh, receiver active recently");
            return Ok(false);
        }
        drop(connection);

        let epoch = self.epoch();
        let zones = self.refresh_zones();
        tracing::debug!("Refreshing {} zones (full: {})", zones.len(), full);

        for zone in &zones {
            for query in ZONE_QUERIES {
                let answered = match self
                    .send_command(query, *zone, "", ErrorPolicy::Raise, true)
                    .await
                {
                    Ok(Some(_)) | Err(AvrError::Device { .. }) => true,
                    Ok(None) => false,
                    Err(e) => {
                        tracing::warn!("Refresh of {} failed: {}", zone, e);
                        false
                    }
                };
                if self.epoch() != epoch {
                    tracing::debug!("Connection changed during refresh");
                    return Ok(false);
                }
                if !answered {
                    tracing::warn!("No answer to {} for {}, connection lost", query, zone);
                    self.spawn_disconnect();
                    return Err(AvrError::Timeout);
                }
            }
        }

        if full {
            self.inner.refreshed.store(true, Ordering::SeqCst);
            self.inner.dispatcher.notify_zones(zones);
        }
        self.inner.dispatcher.notify_refreshed();
        Ok(true)
    }

    /// Discovered zones, or the main zone before discovery has run
    fn refresh_zones(&self) -> ZoneSet {
        let zones = self.zones();
        if zones.is_empty() {
            ZoneSet::from([Zone::Main])
        } else {
            zones
        }
    }

    // ========== Callbacks ==========

    /// Register the callback for a zone, replacing any previous one
    ///
    /// Callbacks run synchronously on the task that observed the change and
    /// must not block. Further protocol I/O belongs in a spawned task.
    pub fn set_zone_callback<F>(&self, zone: Zone, callback: F)
    where
        F: Fn(Zone) + Send + Sync + 'static,
    {
        self.inner.dispatcher.set_zone_callback(zone, Arc::new(callback));
    }

    pub fn clear_zone_callback(&self, zone: Zone) {
        self.inner.dispatcher.clear_zone_callback(zone);
    }

    /// Register the callback fired after each completed refresh
    pub fn set_update_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.dispatcher.set_update_callback(Some(Arc::new(callback)));
    }

    pub fn clear_update_callback(&self) {
        self.inner.dispatcher.set_update_callback(None);
    }

    /// Subscribe to state updates
    ///
    /// Multiple subscriptions can be active simultaneously.
    pub fn subscribe(&self) -> StateReceiver {
        self.inner.dispatcher.subscribe()
    }

    // ========== State accessors ==========

    /// Whether the session is currently up
    pub fn available(&self) -> bool {
        self.inner.state.lock().unwrap().available
    }

    /// Current connection epoch; advances on every successful connect
    pub fn epoch(&self) -> Epoch {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Zones found by [`query_zones`](Self::query_zones)
    pub fn zones(&self) -> ZoneSet {
        self.inner.zones.read().unwrap().clone()
    }

    pub fn zone_state(&self, zone: Zone) -> ZoneState {
        self.inner.state.lock().unwrap().zone(zone)
    }

    pub fn power(&self, zone: Zone) -> Option<bool> {
        self.zone_state(zone).power
    }

    pub fn volume(&self, zone: Zone) -> Option<Volume> {
        self.zone_state(zone).volume
    }

    pub fn max_volume(&self, zone: Zone) -> Volume {
        self.inner.state.lock().unwrap().max_volume(zone)
    }

    pub fn mute(&self, zone: Zone) -> Option<bool> {
        self.zone_state(zone).mute
    }

    pub fn source(&self, zone: Zone) -> Option<String> {
        self.zone_state(zone).source
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.inner.state.lock().unwrap().info.clone()
    }

    /// Consistent copy of the whole cached state
    pub fn state_snapshot(&self) -> DeviceState {
        self.inner.state.lock().unwrap().clone()
    }
}

fn validate_volume(zone: Zone, volume: i32) -> Result<Volume> {
    let max = zone.max_volume();
    match Volume::try_from(volume) {
        Ok(v) if v <= max => Ok(v),
        _ => Err(AvrError::InvalidVolume { zone, volume, max }),
    }
}

/// Listener loop: sole reader of the socket for one epoch
///
/// Never waits for a reply itself; anything needing one is spawned.
async fn listen(weak: WeakClient, connection: Arc<Connection>, mut reader: FrameReader, epoch: Epoch) {
    while let Some(frame) = reader.next_frame().await {
        let Some(client) = weak.upgrade() else {
            return;
        };
        if frame.is_empty() {
            continue;
        }
        tracing::debug!("Received: {}", frame);
        client.handle_frame(&connection, frame, epoch);
    }

    if let Some(client) = weak.upgrade() {
        if client.epoch() == epoch && client.available() {
            tracing::warn!("Lost connection to {}", client.address());
            client.spawn_disconnect();
        }
    }
}

/// Periodic refresh for one epoch
async fn run_updater(weak: WeakClient, epoch: Epoch) {
    loop {
        let interval = match weak.upgrade() {
            Some(client) => client.inner.config.scan_interval,
            None => return,
        };
        tokio::time::sleep(interval).await;

        let Some(client) = weak.upgrade() else {
            return;
        };
        if client.epoch() != epoch {
            return;
        }
        if let Err(e) = client.update(false).await {
            tracing::warn!("Scheduled refresh failed: {}", e);
        }
    }
}
