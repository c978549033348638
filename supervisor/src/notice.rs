//! Classification of raw engine notices into typed activity updates.
//!
//! The engine emits one JSON object per notice:
//! `{"noticeType": "...", "data": {...}, "timestamp": "..."}`. Numeric fields
//! may arrive as integers, floats or numeric strings.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const ACTIVITY_NOTICE: &str = "InproxyProxyActivity";
pub const TOTAL_ACTIVITY_NOTICE: &str = "InproxyProxyTotalActivity";
pub const INFO_NOTICE: &str = "Info";
pub const ERROR_NOTICE: &str = "Error";
pub const MUST_UPGRADE_NOTICE: &str = "InproxyMustUpgrade";

#[derive(Debug, Deserialize)]
struct RawNotice {
    #[serde(rename = "noticeType")]
    notice_type: String,
    #[serde(default)]
    data: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegionScope {
    Personal,
    Common,
}

impl RegionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionScope::Personal => "personal",
            RegionScope::Common => "common",
        }
    }
}

/// A byte counter either as an increment since the previous notice or as an
/// absolute total since the current engine started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteCount {
    Delta(u64),
    Total(u64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionActivity {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub connecting_clients: i64,
    pub connected_clients: i64,
}

/// Normalized activity update. Client counts are latest values; `None` means
/// the field was absent or failed to coerce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityDelta {
    pub announcing: Option<i64>,
    pub connecting_clients: Option<i64>,
    pub connected_clients: Option<i64>,
    pub bytes_up: Option<ByteCount>,
    pub bytes_down: Option<ByteCount>,
    pub regions: BTreeMap<RegionScope, BTreeMap<String, RegionActivity>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Activity(ActivityDelta),
    Info(Option<String>),
    Error {
        message: Option<String>,
        data: Map<String, Value>,
    },
    MustUpgrade,
    Other {
        notice_type: String,
        data: Map<String, Value>,
    },
}

/// Returns `None` for anything that is not a well-formed notice envelope.
pub fn classify(raw: &[u8]) -> Option<Notice> {
    let notice: RawNotice = serde_json::from_slice(raw).ok()?;
    let data = notice.data;

    let classified = match notice.notice_type.as_str() {
        ACTIVITY_NOTICE => Notice::Activity(activity_delta(&data, ByteCount::Delta, true)),
        TOTAL_ACTIVITY_NOTICE => Notice::Activity(activity_delta(&data, ByteCount::Total, false)),
        INFO_NOTICE => Notice::Info(string_field(&data, "message")),
        ERROR_NOTICE => Notice::Error {
            message: string_field(&data, "error"),
            data,
        },
        MUST_UPGRADE_NOTICE => Notice::MustUpgrade,
        _ => Notice::Other {
            notice_type: notice.notice_type,
            data,
        },
    };
    Some(classified)
}

fn activity_delta(
    data: &Map<String, Value>,
    byte_count: fn(u64) -> ByteCount,
    incremental: bool,
) -> ActivityDelta {
    let (up_key, down_key) = if incremental {
        ("bytesUp", "bytesDown")
    } else {
        ("totalBytesUp", "totalBytesDown")
    };

    let mut delta = ActivityDelta {
        announcing: int_field(data, "announcing"),
        connecting_clients: int_field(data, "connectingClients"),
        connected_clients: int_field(data, "connectedClients"),
        bytes_up: byte_field(data, up_key).map(byte_count),
        bytes_down: byte_field(data, down_key).map(byte_count),
        regions: BTreeMap::new(),
    };

    if incremental {
        for (scope, key) in [
            (RegionScope::Personal, "personalRegionActivity"),
            (RegionScope::Common, "commonRegionActivity"),
        ] {
            if let Some(regions) = data.get(key).and_then(region_activity) {
                delta.regions.insert(scope, regions);
            }
        }
    }
    delta
}

fn region_activity(raw: &Value) -> Option<BTreeMap<String, RegionActivity>> {
    let by_region = raw.as_object()?;
    let parsed = by_region
        .iter()
        .filter_map(|(region, value)| {
            let fields = value.as_object()?;
            Some((
                region.clone(),
                RegionActivity {
                    bytes_up: byte_field(fields, "bytesUp").unwrap_or(0),
                    bytes_down: byte_field(fields, "bytesDown").unwrap_or(0),
                    connecting_clients: int_field(fields, "connectingClients").unwrap_or(0),
                    connected_clients: int_field(fields, "connectedClients").unwrap_or(0),
                },
            ))
        })
        .collect();
    Some(parsed)
}

fn string_field(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn int_field(data: &Map<String, Value>, key: &str) -> Option<i64> {
    data.get(key).and_then(coerce_i64)
}

fn byte_field(data: &Map<String, Value>, key: &str) -> Option<u64> {
    int_field(data, key).and_then(|v| u64::try_from(v).ok())
}

/// Integer, float (truncated toward zero) or numeric string. Anything else,
/// including non-finite or out-of-range floats, is treated as absent.
pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|v| i64::try_from(v).ok()))
            .or_else(|| n.as_f64().and_then(float_to_i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(float_to_i64))
        }
        _ => None,
    }
}

fn float_to_i64(f: f64) -> Option<i64> {
    if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f.trunc() as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerces_numeric_representations() {
        assert_eq!(coerce_i64(&json!(42)), Some(42));
        assert_eq!(coerce_i64(&json!(-7)), Some(-7));
        assert_eq!(coerce_i64(&json!(12.9)), Some(12));
        assert_eq!(coerce_i64(&json!("123")), Some(123));
        assert_eq!(coerce_i64(&json!(" 4.5 ")), Some(4));
        assert_eq!(coerce_i64(&json!(1.0e3)), Some(1000));
        assert_eq!(coerce_i64(&json!("abc")), None);
        assert_eq!(coerce_i64(&json!(null)), None);
        assert_eq!(coerce_i64(&json!(true)), None);
        assert_eq!(coerce_i64(&json!({"n": 1})), None);
        assert_eq!(coerce_i64(&json!(u64::MAX)), None);
    }

    #[test]
    fn classifies_delta_activity_with_regions() {
        let raw = br#"{"noticeType":"InproxyProxyActivity","data":{"announcing":1,"connectingClients":"2","connectedClients":5.0,"bytesUp":12345,"bytesDown":67890,"personalRegionActivity":{"US":{"bytesUp":111,"bytesDown":222,"connectingClients":1,"connectedClients":2}},"commonRegionActivity":{"BR":{"bytesUp":333,"bytesDown":444,"connectingClients":0,"connectedClients":3},"XX":"bogus"}},"timestamp":"2026-02-10T12:34:56.789Z"}"#;

        let Some(Notice::Activity(delta)) = classify(raw) else {
            panic!("expected activity notice");
        };
        assert_eq!(delta.announcing, Some(1));
        assert_eq!(delta.connecting_clients, Some(2));
        assert_eq!(delta.connected_clients, Some(5));
        assert_eq!(delta.bytes_up, Some(ByteCount::Delta(12345)));
        assert_eq!(delta.bytes_down, Some(ByteCount::Delta(67890)));

        let personal = &delta.regions[&RegionScope::Personal];
        assert_eq!(
            personal["US"],
            RegionActivity {
                bytes_up: 111,
                bytes_down: 222,
                connecting_clients: 1,
                connected_clients: 2,
            }
        );
        let common = &delta.regions[&RegionScope::Common];
        assert_eq!(common.len(), 1);
        assert_eq!(common["BR"].connected_clients, 3);
    }

    #[test]
    fn classifies_total_activity_as_absolute() {
        let raw = br#"{"noticeType":"InproxyProxyTotalActivity","data":{"announcing":0,"connectingClients":0,"connectedClients":1,"totalBytesUp":"900","totalBytesDown":1800,"personalRegionActivity":{"US":{"bytesUp":1}}}}"#;

        let Some(Notice::Activity(delta)) = classify(raw) else {
            panic!("expected activity notice");
        };
        assert_eq!(delta.bytes_up, Some(ByteCount::Total(900)));
        assert_eq!(delta.bytes_down, Some(ByteCount::Total(1800)));
        assert!(delta.regions.is_empty());
    }

    #[test]
    fn bad_fields_are_absent_not_errors() {
        let raw = br#"{"noticeType":"InproxyProxyActivity","data":{"announcing":"yes","bytesUp":-5,"bytesDown":[1],"personalRegionActivity":7}}"#;

        let Some(Notice::Activity(delta)) = classify(raw) else {
            panic!("expected activity notice");
        };
        assert_eq!(delta, ActivityDelta::default());
    }

    #[test]
    fn classifies_status_notices() {
        assert_eq!(
            classify(br#"{"noticeType":"Info","data":{"message":"hello"}}"#),
            Some(Notice::Info(Some("hello".to_string())))
        );
        assert_eq!(
            classify(br#"{"noticeType":"InproxyMustUpgrade","data":{}}"#),
            Some(Notice::MustUpgrade)
        );
        let Some(Notice::Error { message, .. }) =
            classify(br#"{"noticeType":"Error","data":{"error":"boom"}}"#)
        else {
            panic!("expected error notice");
        };
        assert_eq!(message.as_deref(), Some("boom"));

        let Some(Notice::Other { notice_type, data }) =
            classify(br#"{"noticeType":"Tunnels","data":{"count":0}}"#)
        else {
            panic!("expected other notice");
        };
        assert_eq!(notice_type, "Tunnels");
        assert_eq!(data["count"], json!(0));
    }

    #[test]
    fn malformed_records_are_dropped() {
        assert_eq!(classify(b"not json"), None);
        assert_eq!(classify(br#"{"data":{}}"#), None);
        assert_eq!(classify(br#"{"noticeType":7}"#), None);
        assert_eq!(classify(b""), None);
    }

    #[test]
    fn missing_data_is_an_empty_map() {
        assert_eq!(
            classify(br#"{"noticeType":"InproxyProxyActivity"}"#),
            Some(Notice::Activity(ActivityDelta::default()))
        );
    }
}
