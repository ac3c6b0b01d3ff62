//! Classify raw WebSocket frames into device events or malformed records.
//!
//! # Pipeline
//! 1. JSON parse failure → `Malformed` with code `parse_error`
//! 2. `type` ≠ `"next"` → `Ignored` (protocol message, caller skips)
//! 3. Missing `payload.data.devices` path → `Malformed` with `schema_mismatch`
//! 4. Device object without `id` → `Malformed` with `missing_fields`
//! 5. Otherwise → `Device` carrying the `devices` object unchanged

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::models::{ErrorCode, ErrorDetail, MalformedEvent, SourceInfo};

/// Maximum bytes of raw payload preserved in malformed events.
pub const MAX_RAW_PAYLOAD_BYTES: usize = 4096;

/// Outcome of classifying a single raw frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// A well-formed `next` event; carries the `devices` object.
    Device(Value),
    /// The frame could not be parsed or failed structural checks.
    Malformed(MalformedEvent),
    /// A valid protocol message that is not a data event.
    Ignored,
}

/// Classify one raw WebSocket frame.
///
/// `instance_id` and `subscription_id` populate the `source` block of any
/// malformed record produced.
pub fn classify(raw: &str, instance_id: &str, subscription_id: Option<&str>) -> Classification {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let source = SourceInfo {
        instance_id: instance_id.to_owned(),
        subscription_id: subscription_id.map(ToOwned::to_owned),
    };

    let msg: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            return Classification::Malformed(malformed(
                ErrorCode::ParseError,
                e.to_string(),
                raw,
                &now,
                source,
            ));
        }
    };

    if msg.get("type").and_then(Value::as_str) != Some("next") {
        return Classification::Ignored;
    }

    let Some(devices) = msg
        .get("payload")
        .and_then(|p| p.get("data"))
        .and_then(|d| d.get("devices"))
    else {
        return Classification::Malformed(malformed(
            ErrorCode::SchemaMismatch,
            "Missing path: payload.data.devices".to_owned(),
            raw,
            &now,
            source,
        ));
    };

    if !devices.as_object().is_some_and(|o| o.contains_key("id")) {
        return Classification::Malformed(malformed(
            ErrorCode::MissingFields,
            "Device object missing required field: id".to_owned(),
            raw,
            &now,
            source,
        ));
    }

    Classification::Device(devices.clone())
}

fn malformed(
    code: ErrorCode,
    message: String,
    raw: &str,
    now: &str,
    source: SourceInfo,
) -> MalformedEvent {
    let truncated = raw.len() > MAX_RAW_PAYLOAD_BYTES;
    let raw_payload = if truncated {
        truncate_utf8(raw, MAX_RAW_PAYLOAD_BYTES).to_owned()
    } else {
        raw.to_owned()
    };

    MalformedEvent {
        event_type: "malformed".to_owned(),
        timestamp: now.to_owned(),
        received_at: now.to_owned(),
        error: ErrorDetail {
            code,
            message,
            raw_payload,
            raw_payload_truncated: truncated,
        },
        source,
    }
}

/// Cut `s` to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_utf8(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn next_message(devices: Value) -> String {
        json!({
            "id": "1",
            "type": "next",
            "payload": {"data": {"devices": devices}},
        })
        .to_string()
    }

    #[test]
    fn valid_next_message_returns_devices() {
        let raw = next_message(json!({
            "id": "d290f1ee-6c54-4b01-90e6-d701748f0851",
            "label": "Fleet-Truck-042",
            "services": {"rtk": {"enabled": true, "connectionStatus": "CONNECTED"}},
        }));
        match classify(&raw, "test", None) {
            Classification::Device(d) => {
                assert_eq!(d["id"], "d290f1ee-6c54-4b01-90e6-d701748f0851");
                assert_eq!(d["label"], "Fleet-Truck-042");
            }
            other => panic!("expected Device, got {other:?}"),
        }
    }

    #[test]
    fn invalid_json_is_parse_error() {
        match classify("{not valid json!!!", "test", None) {
            Classification::Malformed(m) => {
                assert_eq!(m.error.code, ErrorCode::ParseError);
                assert_eq!(m.event_type, "malformed");
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn non_next_type_is_ignored() {
        let raw = json!({"type": "connection_ack"}).to_string();
        assert_eq!(classify(&raw, "test", None), Classification::Ignored);
    }

    #[test]
    fn missing_payload_path_is_schema_mismatch() {
        let raw = json!({"id": "1", "type": "next", "payload": {"data": {}}}).to_string();
        match classify(&raw, "test", None) {
            Classification::Malformed(m) => {
                assert_eq!(m.error.code, ErrorCode::SchemaMismatch);
                assert_eq!(m.error.message, "Missing path: payload.data.devices");
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn missing_device_id_is_missing_fields() {
        let raw = next_message(json!({"label": "no-id-device"}));
        match classify(&raw, "test", None) {
            Classification::Malformed(m) => {
                assert_eq!(m.error.code, ErrorCode::MissingFields);
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn oversized_raw_payload_is_truncated() {
        let big = "x".repeat(MAX_RAW_PAYLOAD_BYTES + 1000);
        let raw = format!("{{\"not\": \"{big}\"");
        match classify(&raw, "test", None) {
            Classification::Malformed(m) => {
                assert!(m.error.raw_payload_truncated);
                assert!(m.error.raw_payload.len() <= MAX_RAW_PAYLOAD_BYTES);
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn small_payload_is_not_truncated() {
        match classify("not json", "test", None) {
            Classification::Malformed(m) => {
                assert!(!m.error.raw_payload_truncated);
                assert_eq!(m.error.raw_payload, "not json");
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // Multibyte characters straddling the limit must not split.
        let raw = "é".repeat(MAX_RAW_PAYLOAD_BYTES); // 2 bytes each
        match classify(&raw, "test", None) {
            Classification::Malformed(m) => {
                assert!(m.error.raw_payload_truncated);
                assert!(m.error.raw_payload.len() <= MAX_RAW_PAYLOAD_BYTES);
                assert!(m.error.raw_payload.chars().all(|c| c == 'é'));
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn malformed_carries_source_info() {
        match classify("bad", "writer-07", Some("sub-1")) {
            Classification::Malformed(m) => {
                assert_eq!(m.source.instance_id, "writer-07");
                assert_eq!(m.source.subscription_id.as_deref(), Some("sub-1"));
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
    }
}
