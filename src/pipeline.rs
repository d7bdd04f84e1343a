//! Advertisement pipeline: report burst in, normalized beacon records out.
//!
//! For every advertisement, in order: attach the gateway id, apply the MAC
//! filter, extract the device name, decode iBeacon fields and render the
//! receive time. Nothing in here can fail; unknown or malformed elements just
//! leave the corresponding record fields empty.

use crate::advertisement::{AD_TYPE_COMPLETE_NAME, AD_TYPE_SHORT_NAME, RawAdvertisement, Tlv};
use crate::ibeacon::find_ibeacon;
use crate::mac_filter::MacFilter;
use crate::record::{AdvertisementPayload, BeaconRecord};
use chrono::DateTime;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Stateless decoder shared by all gateway sessions.
#[derive(Debug, Clone, Default)]
pub struct AdvertisementPipeline {
    filter: Option<MacFilter>,
}

impl AdvertisementPipeline {
    /// Without a filter every advertisement is kept.
    pub fn new(filter: Option<MacFilter>) -> Self {
        Self { filter }
    }

    /// Process one report burst from `gateway_id`, preserving arrival order.
    pub fn process(&self, gateway_id: &str, burst: &[RawAdvertisement]) -> Vec<BeaconRecord> {
        burst
            .iter()
            .filter(|adv| self.accepts(adv))
            .map(|adv| normalize(gateway_id, adv))
            .collect()
    }

    fn accepts(&self, adv: &RawAdvertisement) -> bool {
        self.filter
            .as_ref()
            .is_none_or(|filter| filter.allows(&adv.device_id.display_mac()))
    }
}

/// Build the record for a single advertisement, no filtering applied.
pub fn normalize(gateway_id: &str, adv: &RawAdvertisement) -> BeaconRecord {
    BeaconRecord {
        gateway_id: gateway_id.to_string(),
        mac: adv.device_id.display_mac(),
        device_id: adv.device_id,
        timestamp: format_timestamp(adv.seconds, adv.microseconds),
        timestamp_ns: adv.timestamp_nanos(),
        device_type: adv.device_type,
        event_type: adv.event_type,
        rssi: adv.rssi,
        adv_len: adv.adv_payload.len(),
        rsp_len: adv.scan_response_payload.len(),
        name: extract_name(&adv.adv_payload, &adv.scan_response_payload),
        ibeacon: find_ibeacon(&adv.adv_payload),
        payload: AdvertisementPayload {
            adv: adv.adv_payload.clone(),
            rsp: adv.scan_response_payload.clone(),
        },
    }
}

/// Device name from the first short/complete name element, looking at the
/// advertisement before the scan response. Empty when neither carries one.
pub fn extract_name(adv: &[Tlv], rsp: &[Tlv]) -> String {
    adv.iter()
        .chain(rsp)
        .find(|tlv| matches!(tlv.ad_type, AD_TYPE_SHORT_NAME | AD_TYPE_COMPLETE_NAME))
        .map(|tlv| tlv.value.clone())
        .unwrap_or_default()
}

/// Render `seconds + microseconds * 1e-6` as a UTC date-time string.
pub fn format_timestamp(seconds: i64, microseconds: u32) -> String {
    let carry = i64::from(microseconds / 1_000_000);
    let nanos = (microseconds % 1_000_000) * 1_000;
    match DateTime::from_timestamp(seconds.saturating_add(carry), nanos) {
        Some(time) => time.format(TIMESTAMP_FORMAT).to_string(),
        None => format!("{seconds}.{microseconds:06}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{IBEACON_HEX, advertisement, named_advertisement};

    #[test]
    fn test_records_carry_gateway_id() {
        let burst = vec![advertisement("010203040506"), advertisement("0a0b0c0d0e0f")];
        let records = AdvertisementPipeline::new(None).process("gw-7", &burst);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.gateway_id == "gw-7"));
    }

    #[test]
    fn test_filter_keeps_only_matching() {
        let filter = MacFilter::new(["06:05:04:03:02:01", "ff:ff:ff:ff:ff:ff"]);
        let burst = vec![
            advertisement("010203040506"),
            advertisement("0a0b0c0d0e0f"),
            advertisement("ffffffffffff"),
            advertisement("112233445566"),
        ];
        let records = AdvertisementPipeline::new(Some(filter)).process("gw", &burst);
        let macs: Vec<String> = records.iter().map(|r| r.mac.to_string()).collect();
        assert_eq!(macs, vec!["06:05:04:03:02:01", "FF:FF:FF:FF:FF:FF"]);
    }

    #[test]
    fn test_empty_filter_drops_everything() {
        let burst = vec![advertisement("010203040506")];
        let records = AdvertisementPipeline::new(Some(MacFilter::default())).process("gw", &burst);
        assert!(records.is_empty());
    }

    #[test]
    fn test_empty_burst() {
        assert!(AdvertisementPipeline::default().process("gw", &[]).is_empty());
    }

    #[test]
    fn test_name_prefers_advertisement_payload() {
        let adv = vec![Tlv::new(0x01, "06"), Tlv::new(AD_TYPE_SHORT_NAME, "Short")];
        let rsp = vec![Tlv::new(AD_TYPE_COMPLETE_NAME, "Complete")];
        assert_eq!(extract_name(&adv, &rsp), "Short");
    }

    #[test]
    fn test_name_falls_back_to_scan_response() {
        let adv = vec![Tlv::new(0x01, "06")];
        let rsp = vec![Tlv::new(0x0A, "00"), Tlv::new(AD_TYPE_COMPLETE_NAME, "Complete")];
        assert_eq!(extract_name(&adv, &rsp), "Complete");
    }

    #[test]
    fn test_name_missing_is_empty() {
        assert_eq!(extract_name(&[], &[]), "");
        assert_eq!(extract_name(&[Tlv::new(0xFF, "4c00")], &[Tlv::new(0x0A, "00")]), "");
    }

    #[test]
    fn test_normalize_decodes_ibeacon() {
        let mut adv = named_advertisement("ffeeddccbbaa", "Beacon");
        adv.adv_payload.push(Tlv::new(0xFF, IBEACON_HEX));
        let record = normalize("gw", &adv);
        assert_eq!(record.name, "Beacon");
        assert_eq!(record.adv_len, 3);
        assert_eq!(record.rsp_len, 0);
        let beacon = record.ibeacon.unwrap();
        assert_eq!(beacon.major_hex(), "0001");
        assert_eq!(beacon.calibrated_rssi, -59);
    }

    #[test]
    fn test_normalize_short_manufacturer_data() {
        let mut adv = advertisement("ffeeddccbbaa");
        adv.adv_payload.push(Tlv::new(0xFF, "4c000215"));
        let record = normalize("gw", &adv);
        assert!(record.ibeacon.is_none());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("major").is_none());
        assert_eq!(json["did"], "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0, 0), "1970-01-01 00:00:00.000000");
        assert_eq!(
            format_timestamp(1_500_000_000, 123_456),
            "2017-07-14 02:40:00.123456"
        );
        // Whole seconds in the microsecond part carry over.
        assert_eq!(format_timestamp(0, 1_500_000), "1970-01-01 00:00:01.500000");
    }

    #[test]
    fn test_record_timestamp_nanos() {
        let mut adv = advertisement("010203040506");
        adv.seconds = 10;
        adv.microseconds = 1;
        assert_eq!(normalize("gw", &adv).timestamp_ns, 10_000_001_000);
    }
}
