//! `beacon-gateway-scanner` library.
//!
//! The binary (`src/main.rs`) is responsible for logging setup, signal handling
//! and process exit codes. The core logic lives in [`crate::app`] and
//! [`crate::orchestrator`] where it can be tested deterministically with an
//! injected gateway connector, telemetry sink and output stream.

pub mod advertisement;
pub mod app;
pub mod config;
pub mod gateway;
pub mod ibeacon;
pub mod mac_address;
pub mod mac_filter;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod record;
pub mod scan_cycle;
pub mod session;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::{RawAdvertisement, Tlv};
pub use config::{ConfigError, ConfigProvider, GatewayCredential, ScanConfig, ScanMode};
pub use gateway::{GatewayApi, GatewayConnector, GatewayFrame, TransportError};
pub use ibeacon::IBeacon;
pub use mac_address::{DeviceId, MacAddress};
pub use mac_filter::MacFilter;
pub use orchestrator::Orchestrator;
pub use output::{SinkError, Telemetry, TelemetrySink};
pub use pipeline::AdvertisementPipeline;
pub use record::BeaconRecord;
pub use session::{GatewaySession, SessionError, SessionState};
pub use shutdown::{ExitFlag, ShutdownCoordinator};
