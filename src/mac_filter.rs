//! Operator supplied allow-list of device MAC addresses.

use crate::config::ConfigError;
use crate::mac_address::MacAddress;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct FilterFile {
    #[serde(rename = "devList")]
    dev_list: Vec<String>,
}

/// Set of uppercase MAC strings an advertisement must match to be kept.
///
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MacFilter {
    allowed: BTreeSet<String>,
}

impl MacFilter {
    pub fn new<I, S>(macs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = macs
            .into_iter()
            .map(|mac| mac.as_ref().trim().to_uppercase())
            .collect();
        Self { allowed }
    }

    /// Load a filter file of the form `{ "devList": ["AA:BB:CC:DD:EE:FF", ...] }`.
    /// The file is JSON5, so comments, unquoted keys, single quotes and
    /// trailing commas are accepted.
    ///
    /// A missing file or malformed content is a configuration error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FilterNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::FilterUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FilterFile =
            json5::from_str(&content).map_err(|source| ConfigError::FilterMalformed {
                path: path.to_path_buf(),
                source,
            })?;

        for entry in &file.dev_list {
            if entry.parse::<MacAddress>().is_err() {
                warn!(entry = %entry, "filter entry is not a MAC address and will never match");
            }
        }

        let filter = Self::new(file.dev_list);
        debug!(path = %path.display(), entries = filter.len(), "loaded MAC filter");
        Ok(filter)
    }

    /// Whether `mac` is on the allow-list. Display MACs are uppercase, so this
    /// is a case-insensitive comparison against the configured entries.
    pub fn allows(&self, mac: &MacAddress) -> bool {
        self.allowed.contains(&mac.to_string())
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}
