//! InfluxDB line protocol points for beacon telemetry.

use crate::record::BeaconRecord;
use std::collections::BTreeMap;
use std::fmt;

/// Measurement holding one point per forwarded advertisement.
pub const ADVERTISEMENT_MEASUREMENT: &str = "raw_adv";
/// Measurement holding one point per report burst.
pub const RATE_MEASUREMENT: &str = "rate_m";

/// Field values for InfluxDB line protocol
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    String(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Integer(num) => write!(f, "{num}i"),
            FieldValue::String(s) => {
                write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            }
        }
    }
}

/// Data point in InfluxDB line protocol
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, FieldValue>,
    /// Nanoseconds since the Unix epoch; `None` lets the server assign one.
    pub timestamp: Option<i64>,
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys share the same escaping rules.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn fmt_tags(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (key, value) in data_point.tag_set.iter() {
        write!(fmt, ",{}={}", escape_key(key), escape_key(value))?;
    }
    Ok(())
}

fn fmt_fields(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut first = true;
    for (key, value) in data_point.field_set.iter() {
        if first {
            first = false;
        } else {
            write!(fmt, ",")?;
        }
        write!(fmt, "{}={}", escape_key(key), value)?;
    }
    Ok(())
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", escape_measurement(&self.measurement))?;
        fmt_tags(self, fmt)?;
        write!(fmt, " ")?;
        fmt_fields(self, fmt)?;
        if let Some(nanos) = self.timestamp {
            write!(fmt, " {nanos}")?;
        }
        Ok(())
    }
}

/// `raw_adv` point for one record, timestamped with the gateway receive time.
pub fn advertisement_point(record: &BeaconRecord) -> DataPoint {
    let mut tag_set = BTreeMap::new();
    tag_set.insert("macid".to_string(), record.device_id.to_string());
    tag_set.insert("gwid".to_string(), record.gateway_id.clone());

    let payload = serde_json::to_string(&record.payload).unwrap_or_default();

    let mut field_set = BTreeMap::new();
    field_set.insert("rssi".to_string(), FieldValue::Integer(i64::from(record.rssi)));
    field_set.insert("ad".to_string(), FieldValue::String(payload));
    field_set.insert(
        "dtype".to_string(),
        FieldValue::Integer(i64::from(record.device_type)),
    );
    field_set.insert(
        "ev".to_string(),
        FieldValue::Integer(i64::from(record.event_type)),
    );
    field_set.insert("ts".to_string(), FieldValue::Integer(record.timestamp_ns));

    DataPoint {
        measurement: ADVERTISEMENT_MEASUREMENT.to_string(),
        tag_set,
        field_set,
        timestamp: Some(record.timestamp_ns),
    }
}

/// `rate_m` point carrying the size of one report burst.
pub fn rate_point(gateway_id: &str, count: usize) -> DataPoint {
    let mut tag_set = BTreeMap::new();
    tag_set.insert("gwid".to_string(), gateway_id.to_string());

    let mut field_set = BTreeMap::new();
    field_set.insert(
        "count".to_string(),
        FieldValue::Integer(i64::try_from(count).unwrap_or(i64::MAX)),
    );

    DataPoint {
        measurement: RATE_MEASUREMENT.to_string(),
        tag_set,
        field_set,
        timestamp: None,
    }
}
