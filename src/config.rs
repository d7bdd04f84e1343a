//! Startup configuration: credentials, gateway selection, scan parameters and
//! the optional MAC filter location.
//!
//! Everything here is captured once before any session starts and is
//! read-only afterwards.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Fatal configuration problems. These abort startup through the shutdown
/// path.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no gateway credentials supplied")]
    MissingCredentials,
    #[error("no gateways selected")]
    NoGatewaysSelected,
    #[error("MAC filter file does not exist: {}", .0.display())]
    FilterNotFound(PathBuf),
    #[error("cannot read MAC filter file {}: {source}", path.display())]
    FilterUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed MAC filter file {}: {source}", path.display())]
    FilterMalformed {
        path: PathBuf,
        source: json5::Error,
    },
}

/// Account credentials for the gateway API.
#[derive(Clone, PartialEq, Eq)]
pub struct GatewayCredential {
    user: String,
    password: String,
}

impl GatewayCredential {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for GatewayCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayCredential")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// BLE scan mode requested from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ScanMode {
    /// Request scan responses from advertisers
    #[default]
    Active,
    /// Listen only
    Passive,
}

impl ScanMode {
    pub fn is_active(self) -> bool {
        self == ScanMode::Active
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Active => write!(f, "active"),
            ScanMode::Passive => write!(f, "passive"),
        }
    }
}

/// Scan parameters shared by every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    pub mode: ScanMode,
    /// Scan duration in seconds; the gateway emits "scan complete" after it.
    pub period: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mode: ScanMode::Active,
            period: 1,
        }
    }
}

/// Source of the operator's choices at startup.
pub trait ConfigProvider {
    fn credentials(&self) -> Result<GatewayCredential, ConfigError>;

    /// Pick the gateways to scan with from those the account can reach.
    fn select_gateways(&self, available: &[String]) -> Result<Vec<String>, ConfigError>;

    fn scan_parameters(&self) -> ScanConfig;

    fn mac_filter_path(&self) -> Option<PathBuf>;
}

/// [`ConfigProvider`] backed by command-line options.
#[derive(Debug, Clone, Default)]
pub struct CliConfigProvider {
    pub user: Option<String>,
    pub password: Option<String>,
    /// Requested gateway ids; empty means every available gateway.
    pub gateways: Vec<String>,
    pub scan: ScanConfig,
    pub mac_filter: Option<PathBuf>,
}

impl ConfigProvider for CliConfigProvider {
    fn credentials(&self) -> Result<GatewayCredential, ConfigError> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) if !user.is_empty() => {
                Ok(GatewayCredential::new(user.clone(), password.clone()))
            }
            _ => Err(ConfigError::MissingCredentials),
        }
    }

    fn select_gateways(&self, available: &[String]) -> Result<Vec<String>, ConfigError> {
        let selected: Vec<String> = if self.gateways.is_empty() {
            available.to_vec()
        } else {
            let mut selected = Vec::new();
            for id in &self.gateways {
                if !available.contains(id) {
                    warn!(gateway = %id, "gateway is not available to this account, skipping");
                } else if !selected.contains(id) {
                    selected.push(id.clone());
                }
            }
            selected
        };

        if selected.is_empty() {
            return Err(ConfigError::NoGatewaysSelected);
        }
        Ok(selected)
    }

    fn scan_parameters(&self) -> ScanConfig {
        self.scan
    }

    fn mac_filter_path(&self) -> Option<PathBuf> {
        self.mac_filter.clone()
    }
}

/// Parse a duration such as `5000ms`, `3s`, `1m` or `2h`.
/// A bare number is interpreted as seconds.
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let split = src
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(src.len());
    let (number, unit) = src.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {}", src))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("invalid duration unit '{}' in {}", other, src)),
    }
}
