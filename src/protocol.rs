//! Wire-level command table and request descriptions
//!
//! Commands are looked up by symbolic name and zone. An entry is either a
//! plain send code (fire and forget) or a send code paired with the prefix of
//! the response that acknowledges it.

use crate::types::Zone;

/// Line terminator appended to every outgoing command
pub const COMMAND_TERMINATOR: &str = "\r";

/// First character of every error response
pub const ERROR_MARKER: char = 'E';

/// How an error response from the receiver is handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Surface the error to the caller as `AvrError::Device`
    #[default]
    Raise,
    /// Log at error level and report failure
    Log,
    /// Log at debug level and report failure
    Ignore,
}

/// Entry in the command table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Written without waiting for a reply
    Send(&'static str),
    /// Written and acknowledged by a frame starting with `response`
    Request {
        code: &'static str,
        response: &'static str,
    },
}

const fn req(code: &'static str, response: &'static str) -> Option<Command> {
    Some(Command::Request { code, response })
}

/// Resolve a command name for a zone
///
/// Returns `None` when the command does not exist for that zone.
pub fn lookup(name: &str, zone: Zone) -> Option<Command> {
    use Zone::*;
    match (name, zone) {
        ("turn_on", Main) => req("PO", "PWR"),
        ("turn_on", Zone2) => req("APO", "APR"),
        ("turn_on", Zone3) => req("BPO", "BPR"),
        ("turn_on", HdZone) => req("ZEO", "ZEP"),
        ("turn_off", Main) => req("PF", "PWR"),
        ("turn_off", Zone2) => req("APF", "APR"),
        ("turn_off", Zone3) => req("BPF", "BPR"),
        ("turn_off", HdZone) => req("ZEF", "ZEP"),
        ("select_source", Main) => req("FN", "FN"),
        ("select_source", Zone2) => req("ZS", "Z2F"),
        ("select_source", Zone3) => req("ZT", "Z3F"),
        ("select_source", HdZone) => req("ZEA", "ZEA"),
        ("volume_up", Main) => req("VU", "VOL"),
        ("volume_up", Zone2) => req("ZU", "ZV"),
        ("volume_up", Zone3) => req("YU", "YV"),
        ("volume_up", HdZone) => req("HZU", "XV"),
        ("volume_down", Main) => req("VD", "VOL"),
        ("volume_down", Zone2) => req("ZD", "ZV"),
        ("volume_down", Zone3) => req("YD", "YV"),
        ("volume_down", HdZone) => req("HZD", "XV"),
        ("set_volume_level", Main) => req("VL", "VOL"),
        ("set_volume_level", Zone2) => req("ZV", "ZV"),
        ("set_volume_level", Zone3) => req("YV", "YV"),
        ("set_volume_level", HdZone) => req("HZV", "XV"),
        ("mute_on", Main) => req("MO", "MUT"),
        ("mute_on", Zone2) => req("Z2MO", "Z2MUT"),
        ("mute_on", Zone3) => req("Z3MO", "Z3MUT"),
        ("mute_on", HdZone) => req("HZMO", "HZMUT"),
        ("mute_off", Main) => req("MF", "MUT"),
        ("mute_off", Zone2) => req("Z2MF", "Z2MUT"),
        ("mute_off", Zone3) => req("Z3MF", "Z3MUT"),
        ("mute_off", HdZone) => req("HZMF", "HZMUT"),
        ("query_power", Main) => req("?P", "PWR"),
        ("query_power", Zone2) => req("?AP", "APR"),
        ("query_power", Zone3) => req("?BP", "BPR"),
        ("query_power", HdZone) => req("?ZEP", "ZEP"),
        ("query_volume", Main) => req("?V", "VOL"),
        ("query_volume", Zone2) => req("?ZV", "ZV"),
        ("query_volume", Zone3) => req("?YV", "YV"),
        ("query_volume", HdZone) => req("?HZV", "XV"),
        ("query_mute", Main) => req("?M", "MUT"),
        ("query_mute", Zone2) => req("?Z2M", "Z2MUT"),
        ("query_mute", Zone3) => req("?Z3M", "Z3MUT"),
        ("query_mute", HdZone) => req("?HZM", "HZMUT"),
        ("query_source_id", Main) => req("?F", "FN"),
        ("query_source_id", Zone2) => req("?ZS", "Z2F"),
        ("query_source_id", Zone3) => req("?ZT", "Z3F"),
        ("query_source_id", HdZone) => req("?ZEA", "ZEA"),
        ("query_model", Main) => req("?RGD", "RGD"),
        ("query_software_version", Main) => req("?SSI", "SSI"),
        ("query_mac_address", Main) => req("?SVB", "SVB"),
        ("power_on_raw", Main) => Some(Command::Send("PO")),
        _ => None,
    }
}

/// A request awaiting its acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub line: String,
    pub expected_prefix: String,
    pub policy: ErrorPolicy,
}

impl Request {
    /// Create a request that raises on device errors
    pub fn new(line: impl Into<String>, expected_prefix: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            expected_prefix: expected_prefix.into(),
            policy: ErrorPolicy::default(),
        }
    }

    /// Set how device error responses are handled
    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Outcome of matching one incoming frame against a pending request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameMatch {
    Answer,
    DeviceError,
    Unrelated,
}

pub(crate) fn match_frame(frame: &str, expected_prefix: &str) -> FrameMatch {
    if frame.starts_with(expected_prefix) {
        FrameMatch::Answer
    } else if frame.starts_with(ERROR_MARKER) {
        FrameMatch::DeviceError
    } else {
        FrameMatch::Unrelated
    }
}

/// Zero-padded volume prefix for `set_volume_level`
pub(crate) fn volume_prefix(zone: Zone, volume: u16) -> String {
    format!("{:0width$}", volume, width = zone.volume_digits())
}

/// Two-digit source code prefix for `select_source` and source probing
pub(crate) fn source_prefix(code: u8) -> String {
    format!("{:02}", code)
}
