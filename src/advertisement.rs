//! Raw advertisement data as pushed by a gateway in a report burst.

use crate::mac_address::DeviceId;
use serde::{Deserialize, Serialize};

/// AD type: shortened local name.
pub const AD_TYPE_SHORT_NAME: u8 = 0x08;
/// AD type: complete local name.
pub const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
/// AD type: manufacturer specific data.
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// One type-length-value element of an advertisement or scan response.
///
/// The gateway has already split the payload, so the length is implicit in
/// `value`. Binary types carry hex text; name types carry the decoded name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tlv {
    #[serde(rename = "t")]
    pub ad_type: u8,
    #[serde(rename = "v", default)]
    pub value: String,
}

impl Tlv {
    pub fn new(ad_type: u8, value: impl Into<String>) -> Self {
        Self {
            ad_type,
            value: value.into(),
        }
    }

    /// Decoded bytes of a hex valued element, `None` if the value is not hex.
    pub fn bytes(&self) -> Option<Vec<u8>> {
        hex::decode(&self.value).ok()
    }
}

/// A single advertisement within a report burst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAdvertisement {
    #[serde(rename = "did")]
    pub device_id: DeviceId,
    #[serde(rename = "dtype", default)]
    pub device_type: u8,
    #[serde(rename = "ev", default)]
    pub event_type: u8,
    pub rssi: i16,
    /// Receive time, whole seconds since the Unix epoch.
    #[serde(rename = "tss", default)]
    pub seconds: i64,
    /// Receive time, microsecond part.
    #[serde(rename = "tsus", default)]
    pub microseconds: u32,
    #[serde(rename = "adv", default)]
    pub adv_payload: Vec<Tlv>,
    #[serde(rename = "rsp", default)]
    pub scan_response_payload: Vec<Tlv>,
}

impl RawAdvertisement {
    /// Receive time in nanoseconds since the Unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.seconds
            .saturating_mul(1_000_000_000)
            .saturating_add(i64::from(self.microseconds) * 1_000)
    }
}
