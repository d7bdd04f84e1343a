//! Gateway transport abstraction.
//!
//! A gateway exposes request/response commands (auth, open, version, list,
//! ...) plus two push subscriptions, events and reports, delivered in FIFO
//! order per connection. [`GatewayApi`] is one such connection and
//! [`GatewayConnector`] creates them, so sessions can be driven by a real
//! transport or by a scripted fake in tests.

pub mod tcp;

use crate::advertisement::RawAdvertisement;
use crate::config::GatewayCredential;
use crate::mac_address::DeviceId;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Event code: a connected device disconnected.
pub const EVENT_DISCONNECT: u32 = 1;
/// Event code: the requested scan period has elapsed.
pub const EVENT_SCAN_COMPLETE: u32 = 39;
/// Report code: advertisement burst.
pub const REPORT_ADVERTISEMENT: u32 = 1;
/// Report code: GATT notification.
pub const REPORT_NOTIFICATION: u32 = 27;

/// Errors raised by a gateway connection.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("gateway rejected '{command}': {message} (code {code})")]
    Rejected {
        command: String,
        code: i64,
        message: String,
    },
    #[error("'{0}' timed out")]
    Timeout(String),
    #[error("connection closed")]
    Closed,
    #[error("push frames are already subscribed")]
    AlreadySubscribed,
}

/// Reply to a successful auth or login.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct AccountInfo {
    /// Gateways reachable with this account.
    #[serde(rename = "gwid", default)]
    pub gateway_ids: Vec<String>,
}

/// A device currently connected through the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ConnectedDevice {
    #[serde(rename = "did", default)]
    pub device_id: Option<DeviceId>,
}

/// Parameters of the `list` (scan) command. A period of zero stops scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanRequest {
    #[serde(serialize_with = "flag")]
    pub active: bool,
    pub period: u32,
}

fn flag<S: serde::Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*value))
}

/// An event pushed by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub code: u32,
    pub body: Value,
}

/// A report pushed by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportFrame {
    /// One burst of advertisements, in the order the gateway saw them.
    Advertisements(Vec<RawAdvertisement>),
    Notification(Value),
    Other { code: u32, body: Value },
}

/// Anything pushed asynchronously on a gateway connection.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayFrame {
    Event(EventFrame),
    Report(ReportFrame),
}

/// One connection to the gateway API.
///
/// Connections created for a specific gateway address every command to it;
/// the account connection (no gateway id) is used for auth, login and logout.
pub trait GatewayApi: Send {
    fn auth<'a>(
        &'a mut self,
        credential: &'a GatewayCredential,
    ) -> BoxFuture<'a, Result<AccountInfo, TransportError>>;

    fn login<'a>(
        &'a mut self,
        credential: &'a GatewayCredential,
    ) -> BoxFuture<'a, Result<AccountInfo, TransportError>>;

    fn logout(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;

    fn open(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;

    fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Gateway firmware version. Only answers when the gateway is online.
    fn version(&mut self) -> BoxFuture<'_, Result<String, TransportError>>;

    /// Devices currently connected through the gateway.
    fn show(&mut self) -> BoxFuture<'_, Result<Vec<ConnectedDevice>, TransportError>>;

    fn disconnect_all(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Start (or with period 0, stop) a scan. Completion is signalled with an
    /// [`EVENT_SCAN_COMPLETE`] event.
    fn list(&mut self, request: ScanRequest) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Subscribe to events and reports for all devices. Can only be done once
    /// per connection.
    fn subscribe(
        &mut self,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<GatewayFrame>, TransportError>>;
}

/// Factory for gateway connections.
pub trait GatewayConnector: Send + Sync {
    /// Connect to the API; `gateway_id` selects the gateway commands go to.
    fn connect<'a>(
        &'a self,
        gateway_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Box<dyn GatewayApi>, TransportError>>;
}
