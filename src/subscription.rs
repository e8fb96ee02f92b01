use crate::error::{AvrError, Result};
use crate::types::Zone;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const UPDATE_BUFFER: usize = 100;

/// Callback invoked with the zone whose state changed
pub type ZoneCallback = Arc<dyn Fn(Zone) + Send + Sync>;

/// Callback invoked after a refresh of the receiver state
pub type UpdateCallback = Arc<dyn Fn() + Send + Sync>;

/// State update delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    /// Cached state of a zone changed, or must be re-read
    Zone(Zone),

    /// A refresh of the receiver state completed
    Refreshed,

    /// The connection came up or went down
    Availability(bool),
}

/// Receiver for state updates
pub struct StateReceiver {
    rx: broadcast::Receiver<StateUpdate>,
}

impl StateReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<StateUpdate>) -> Self {
        Self { rx }
    }

    /// Receive the next state update
    ///
    /// Fails once the client has been dropped.
    pub async fn recv(&mut self) -> Result<StateUpdate> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => {
                AvrError::ChannelError("client dropped".to_string())
            }
            broadcast::error::RecvError::Lagged(n) => {
                AvrError::ChannelError(format!("Lagged by {} updates", n))
            }
        })
    }

    /// Try to receive a state update without blocking
    pub fn try_recv(&mut self) -> Result<Option<StateUpdate>> {
        match self.rx.try_recv() {
            Ok(update) => Ok(Some(update)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => {
                Err(AvrError::ChannelError("client dropped".to_string()))
            }
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(AvrError::ChannelError(format!("Lagged by {} updates", n)))
            }
        }
    }
}

/// Observer table: one callback per zone, one device-wide update callback,
/// plus a broadcast channel for any number of async subscribers
///
/// Callbacks are cloned out of the table before they run, so no lock is
/// held while host code executes.
pub(crate) struct Dispatcher {
    zone_callbacks: Mutex<BTreeMap<Zone, ZoneCallback>>,
    update_callback: Mutex<Option<UpdateCallback>>,
    updates: broadcast::Sender<StateUpdate>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            zone_callbacks: Mutex::new(BTreeMap::new()),
            update_callback: Mutex::new(None),
            updates,
        }
    }

    pub fn set_zone_callback(&self, zone: Zone, callback: ZoneCallback) {
        self.zone_callbacks.lock().unwrap().insert(zone, callback);
    }

    pub fn clear_zone_callback(&self, zone: Zone) {
        self.zone_callbacks.lock().unwrap().remove(&zone);
    }

    pub fn set_update_callback(&self, callback: Option<UpdateCallback>) {
        *self.update_callback.lock().unwrap() = callback;
    }

    pub fn subscribe(&self) -> StateReceiver {
        StateReceiver::new(self.updates.subscribe())
    }

    /// Fire the zone callback of every zone in `zones`
    pub fn notify_zones(&self, zones: impl IntoIterator<Item = Zone>) {
        for zone in zones {
            let callback = self.zone_callbacks.lock().unwrap().get(&zone).cloned();
            if let Some(callback) = callback {
                callback(zone);
            }
            let _ = self.updates.send(StateUpdate::Zone(zone));
        }
    }

    pub fn notify_refreshed(&self) {
        let callback = self.update_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
        let _ = self.updates.send(StateUpdate::Refreshed);
    }

    pub fn notify_availability(&self, available: bool) {
        let _ = self.updates.send(StateUpdate::Availability(available));
    }
}
