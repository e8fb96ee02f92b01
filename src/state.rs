//! Cached receiver state and the response parser that maintains it
//!
//! Parsing is pure: a frame is matched by prefix, decoded, compared with the
//! cached value and stored only when it differs. The returned set contains
//! exactly the zones whose cache changed.

use crate::sources::SourceRegistry;
use crate::types::{DeviceInfo, Volume, Zone, ZoneSet, ZoneState, UNKNOWN};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Power,
    Volume,
    Mute,
    Source,
}

/// Frame prefixes for every zone field, longest first where they overlap
const PREFIXES: &[(&str, Zone, Field)] = &[
    ("PWR", Zone::Main, Field::Power),
    ("APR", Zone::Zone2, Field::Power),
    ("BPR", Zone::Zone3, Field::Power),
    ("ZEP", Zone::HdZone, Field::Power),
    ("VOL", Zone::Main, Field::Volume),
    ("ZV", Zone::Zone2, Field::Volume),
    ("YV", Zone::Zone3, Field::Volume),
    ("XV", Zone::HdZone, Field::Volume),
    ("Z2MUT", Zone::Zone2, Field::Mute),
    ("Z3MUT", Zone::Zone3, Field::Mute),
    ("HZMUT", Zone::HdZone, Field::Mute),
    ("MUT", Zone::Main, Field::Mute),
    ("FN", Zone::Main, Field::Source),
    ("Z2F", Zone::Zone2, Field::Source),
    ("Z3F", Zone::Zone3, Field::Source),
    ("ZEA", Zone::HdZone, Field::Source),
];

/// Process-owned snapshot of everything known about the receiver
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceState {
    pub available: bool,
    pub zones: BTreeMap<Zone, ZoneState>,
    /// Filled in for each zone found by zone discovery
    pub max_volume: BTreeMap<Zone, Volume>,
    pub info: DeviceInfo,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached state for a zone, empty if nothing has been reported
    pub fn zone(&self, zone: Zone) -> ZoneState {
        self.zones.get(&zone).cloned().unwrap_or_default()
    }

    /// Highest volume the zone accepts
    pub fn max_volume(&self, zone: Zone) -> Volume {
        self.max_volume
            .get(&zone)
            .copied()
            .unwrap_or_else(|| zone.max_volume())
    }

    /// Power state of a zone
    pub fn power(&self, zone: Zone) -> Option<bool> {
        self.zones.get(&zone).and_then(|z| z.power)
    }

    /// Decode a frame and update the cache
    ///
    /// Returns the zones whose cached value changed. Unrecognized or
    /// malformed frames change nothing.
    pub fn apply_response(&mut self, frame: &str, sources: &SourceRegistry) -> ZoneSet {
        let mut changed = ZoneSet::new();
        let Some((prefix, zone, field)) = PREFIXES
            .iter()
            .find(|(prefix, _, _)| frame.starts_with(prefix))
        else {
            return changed;
        };
        let value = &frame[prefix.len()..];
        let entry = self.zones.entry(*zone).or_default();

        let updated = match field {
            Field::Power => decode_flag(value).map(|on| replace(&mut entry.power, on)),
            Field::Mute => decode_flag(value).map(|muted| replace(&mut entry.mute, muted)),
            Field::Volume => {
                decode_volume(value).map(|volume| replace(&mut entry.volume, volume))
            }
            Field::Source => decode_source(value)
                .map(|code| replace(&mut entry.source, sources.resolve(code).to_string())),
        };

        match updated {
            Some(true) => {
                tracing::debug!("{} {:?} changed: {}", zone, field, frame);
                changed.insert(*zone);
            }
            Some(false) => {}
            None => tracing::debug!("Ignoring malformed frame: {}", frame),
        }
        changed
    }

    /// Record a device-info frame (`RGD`, `SSI`, `SVB`)
    ///
    /// Returns `true` if the frame carried device information.
    pub fn apply_info(&mut self, frame: &str) -> bool {
        if let Some(model) = frame.strip_prefix("RGD") {
            self.info.model = parse_model(model);
        } else if let Some(version) = frame.strip_prefix("SSI") {
            self.info.software_version = parse_text(version);
        } else if let Some(mac) = frame.strip_prefix("SVB") {
            self.info.mac_address = parse_mac(mac);
        } else {
            return false;
        }
        true
    }
}

fn replace<T: PartialEq>(slot: &mut Option<T>, value: T) -> bool {
    if slot.as_ref() == Some(&value) {
        return false;
    }
    *slot = Some(value);
    true
}

/// `0` means on (power) or muted (mute)
fn decode_flag(value: &str) -> Option<bool> {
    match value {
        "0" => Some(true),
        "1" => Some(false),
        _ => None,
    }
}

fn decode_volume(value: &str) -> Option<Volume> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn decode_source(value: &str) -> Option<&str> {
    (value.len() == 2 && value.chars().all(|c| c.is_ascii_digit())).then_some(value)
}

fn parse_text(value: &str) -> String {
    let text = value.trim().trim_matches('"').trim();
    if text.is_empty() {
        UNKNOWN.to_string()
    } else {
        text.to_string()
    }
}

/// Model names are reported as `<id><name>`; take the last bracketed part
fn parse_model(value: &str) -> String {
    match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => parse_text(&value[start + 1..end]),
        _ => parse_text(value),
    }
}

fn parse_mac(value: &str) -> String {
    let hex = value.trim();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return parse_text(hex);
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(":")
}
