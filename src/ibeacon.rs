//! iBeacon manufacturer-data decoding.
//!
//! An iBeacon frame is a 25 byte manufacturer specific data element:
//!
//! ```text
//! 0..2   company id (little-endian)
//! 2      beacon subtype (0x02 for iBeacon)
//! 3      subtype data length (0x15)
//! 4..20  proximity UUID
//! 20..22 major (big-endian)
//! 22..24 minor (big-endian)
//! 24     calibrated RSSI at 1 m (signed)
//! ```

use crate::advertisement::{AD_TYPE_MANUFACTURER_DATA, Tlv};
use serde::{Serialize, Serializer};

/// Length in bytes of an iBeacon manufacturer data element.
pub const IBEACON_DATA_LEN: usize = 25;

/// Decoded iBeacon fields.
///
/// Serialized with the hex renderings operators expect: company id, major and
/// minor as four uppercase digits, subtype and length as two, the UUID as 32
/// lowercase digits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IBeacon {
    #[serde(serialize_with = "hex4")]
    pub company_id: u16,
    #[serde(serialize_with = "hex2")]
    pub subtype: u8,
    #[serde(serialize_with = "hex2")]
    pub subtype_len: u8,
    #[serde(serialize_with = "uuid_hex")]
    pub proximity_uuid: [u8; 16],
    #[serde(serialize_with = "hex4")]
    pub major: u16,
    #[serde(serialize_with = "hex4")]
    pub minor: u16,
    pub calibrated_rssi: i8,
}

impl IBeacon {
    /// Decode a 25 byte manufacturer data element. Any other length is not
    /// an iBeacon.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let data: &[u8; IBEACON_DATA_LEN] = data.try_into().ok()?;

        let mut proximity_uuid = [0u8; 16];
        proximity_uuid.copy_from_slice(&data[4..20]);

        Some(Self {
            company_id: u16::from_le_bytes([data[0], data[1]]),
            subtype: data[2],
            subtype_len: data[3],
            proximity_uuid,
            major: u16::from_be_bytes([data[20], data[21]]),
            minor: u16::from_be_bytes([data[22], data[23]]),
            calibrated_rssi: data[24] as i8,
        })
    }

    pub fn company_id_hex(&self) -> String {
        format!("{:04X}", self.company_id)
    }

    pub fn subtype_hex(&self) -> String {
        format!("{:02X}", self.subtype)
    }

    pub fn subtype_len_hex(&self) -> String {
        format!("{:02X}", self.subtype_len)
    }

    pub fn uuid_hex(&self) -> String {
        hex::encode(self.proximity_uuid)
    }

    pub fn major_hex(&self) -> String {
        format!("{:04X}", self.major)
    }

    pub fn minor_hex(&self) -> String {
        format!("{:04X}", self.minor)
    }
}

/// Find and decode the iBeacon element in an advertisement payload. When
/// several are present the last one wins.
///
/// Manufacturer elements of the wrong length or with non-hex values are
/// skipped, never reported as errors.
pub fn find_ibeacon(payload: &[Tlv]) -> Option<IBeacon> {
    payload
        .iter()
        .filter(|tlv| tlv.ad_type == AD_TYPE_MANUFACTURER_DATA)
        .filter(|tlv| tlv.value.len() == IBEACON_DATA_LEN * 2)
        .filter_map(|tlv| tlv.bytes().as_deref().and_then(IBeacon::from_bytes))
        .last()
}

fn hex4<S: Serializer>(value: &u16, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:04X}"))
}

fn hex2<S: Serializer>(value: &u8, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:02X}"))
}

fn uuid_hex<S: Serializer>(value: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(value))
}
