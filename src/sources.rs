use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of source codes probed during discovery
pub const MAX_SOURCE_NUMBERS: u8 = 60;

/// Mapping between human-readable source names and two-digit source codes
///
/// Codes that are not in the table resolve to themselves, so a source the
/// receiver reports but which was never discovered still shows something.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct SourceRegistry {
    by_name: BTreeMap<String, String>,
    by_code: BTreeMap<String, String>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source, replacing any previous entry for the same name or code
    pub fn insert(&mut self, name: impl Into<String>, code: impl Into<String>) {
        let name = name.into();
        let code = code.into();
        if let Some(old_code) = self.by_name.remove(&name) {
            self.by_code.remove(&old_code);
        }
        if let Some(old_name) = self.by_code.remove(&code) {
            self.by_name.remove(&old_name);
        }
        self.by_name.insert(name.clone(), code.clone());
        self.by_code.insert(code, name);
    }

    /// Code for a source name
    pub fn code(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(String::as_str)
    }

    /// Name for a source code, falling back to the code itself
    pub fn resolve<'a>(&'a self, code: &'a str) -> &'a str {
        self.by_code.get(code).map(String::as_str).unwrap_or(code)
    }

    /// Source names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Name to code mapping
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.by_name.clone()
    }
}

impl From<BTreeMap<String, String>> for SourceRegistry {
    fn from(map: BTreeMap<String, String>) -> Self {
        let mut registry = Self::new();
        for (name, code) in map {
            registry.insert(name, code);
        }
        registry
    }
}

impl From<SourceRegistry> for BTreeMap<String, String> {
    fn from(registry: SourceRegistry) -> Self {
        registry.by_name
    }
}

/// Source name frame returned for a `?RGB<cc>` probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SourceEntry {
    pub code: String,
    pub active: bool,
    pub name: String,
}

/// Parse `RGB<cc><a><name>` where `a` is `1` for an active source
pub(crate) fn parse_source_frame(frame: &str) -> Option<SourceEntry> {
    let body = frame.strip_prefix("RGB")?;
    let code = body.get(..2)?;
    if !code.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let active = body.get(2..3)? == "1";
    let name = body.get(3..)?.trim().to_string();
    Some(SourceEntry {
        code: code.to_string(),
        active,
        name,
    })
}
