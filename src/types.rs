use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Volume value on the receiver's unit-less scale
pub type Volume = u16;

/// Set of zones touched by a single parse or refresh
pub type ZoneSet = BTreeSet<Zone>;

/// Maximum volume accepted by the main zone
pub const MAX_VOLUME_MAIN: Volume = 185;

/// Maximum volume accepted by the secondary zones
pub const MAX_VOLUME_ZONE: Volume = 81;

/// Placeholder used for device information the receiver did not report
pub const UNKNOWN: &str = "unknown";

/// Independently controllable output of the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Zone {
    Main,
    Zone2,
    Zone3,
    HdZone,
}

impl Zone {
    /// All zones in probing order
    pub const ALL: [Zone; 4] = [Zone::Main, Zone::Zone2, Zone::Zone3, Zone::HdZone];

    /// Zone code used on the wire and in the command table
    pub fn code(self) -> &'static str {
        match self {
            Zone::Main => "1",
            Zone::Zone2 => "2",
            Zone::Zone3 => "3",
            Zone::HdZone => "Z",
        }
    }

    /// Parse a zone code
    pub fn from_code(code: &str) -> Option<Zone> {
        Zone::ALL.into_iter().find(|zone| zone.code() == code)
    }

    /// Highest volume the zone accepts
    pub fn max_volume(self) -> Volume {
        match self {
            Zone::Main => MAX_VOLUME_MAIN,
            _ => MAX_VOLUME_ZONE,
        }
    }

    /// Width of the zero-padded volume prefix for `set_volume_level`
    pub(crate) fn volume_digits(self) -> usize {
        match self {
            Zone::Main => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Zone::Main => "Main Zone",
            Zone::Zone2 => "Zone 2",
            Zone::Zone3 => "Zone 3",
            Zone::HdZone => "HDZone",
        };
        f.write_str(name)
    }
}

/// Cached state of a single zone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneState {
    /// `None` until the receiver has reported power
    pub power: Option<bool>,
    pub volume: Option<Volume>,
    pub mute: Option<bool>,
    /// Source name, or the raw two-digit code when it is not in the source table
    pub source: Option<String>,
}

/// Receiver identification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: String,
    pub software_version: String,
    pub mac_address: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            model: UNKNOWN.to_string(),
            software_version: UNKNOWN.to_string(),
            mac_address: UNKNOWN.to_string(),
        }
    }
}
