//! Normalized beacon record produced by the advertisement pipeline.

use crate::advertisement::Tlv;
use crate::ibeacon::IBeacon;
use crate::mac_address::{DeviceId, MacAddress};
use serde::Serialize;

/// Advertisement and scan response elements, forwarded verbatim to the sink.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AdvertisementPayload {
    pub adv: Vec<Tlv>,
    pub rsp: Vec<Tlv>,
}

/// One advertisement that survived filtering, with gateway context attached.
///
/// The serialized form is what gets printed for operators; the raw payload
/// and nanosecond timestamp are kept for the telemetry sink only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeaconRecord {
    /// Id of the gateway whose session received the burst
    #[serde(rename = "gw")]
    pub gateway_id: String,
    /// Display MAC of the advertiser
    #[serde(rename = "did")]
    pub mac: MacAddress,
    /// Device id as the gateway reported it, used to tag telemetry
    #[serde(skip)]
    pub device_id: DeviceId,
    /// Human-readable receive time (UTC)
    #[serde(rename = "ts")]
    pub timestamp: String,
    #[serde(skip)]
    pub timestamp_ns: i64,
    #[serde(rename = "dt")]
    pub device_type: u8,
    #[serde(rename = "ev")]
    pub event_type: u8,
    pub rssi: i16,
    /// Number of advertisement elements
    #[serde(rename = "adv")]
    pub adv_len: usize,
    /// Number of scan response elements
    #[serde(rename = "rsp")]
    pub rsp_len: usize,
    pub name: String,
    #[serde(flatten)]
    pub ibeacon: Option<IBeacon>,
    #[serde(skip)]
    pub payload: AdvertisementPayload,
}
