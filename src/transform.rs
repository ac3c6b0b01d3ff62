//! Transform device payloads into NDJSON `state_change` records.
//!
//! Maintains an in-memory `device_id → last connectionStatus` ledger so
//! that each record carries the previous state. The ledger is not
//! persisted; on restart every device begins with `previous_state: null`.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::models::{MalformedEvent, SourceInfo, StateChangeEvent};

/// Stateful transform: device object → serialized NDJSON bytes.
pub struct Transformer {
    instance_id: String,
    /// device_id → last observed connectionStatus
    ledger: HashMap<String, String>,
}

impl Transformer {
    pub fn new(instance_id: &str) -> Self {
        Transformer {
            instance_id: instance_id.to_owned(),
            ledger: HashMap::new(),
        }
    }

    /// Convert a validated device object into a newline-terminated NDJSON
    /// line, updating the ledger when a connection status is present.
    pub fn transform(
        &mut self,
        devices: &Value,
        subscription_id: Option<&str>,
    ) -> Result<Vec<u8>, serde_json::Error> {
        let device_id = devices
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        let current_state = safe_get(devices, &["services", "rtk", "connectionStatus"])
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        let previous_state = self.ledger.get(&device_id).cloned();

        if let Some(state) = &current_state {
            self.ledger.insert(device_id.clone(), state.clone());
        }

        let position = safe_get(devices, &["lastPosition", "position", "llaDec"]);
        let coord = |key: &str| position.and_then(|p| p.get(key)).and_then(Value::as_f64);

        let event = StateChangeEvent {
            event_type: "state_change".to_owned(),
            timestamp: safe_get(devices, &["lastPosition", "timestamp"])
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            received_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            device_id,
            device_label: devices
                .get("label")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            previous_state,
            current_state,
            latitude: coord("lat"),
            longitude: coord("lon"),
            altitude_m: coord("alt"),
            rtk_enabled: safe_get(devices, &["services", "rtk", "enabled"])
                .and_then(Value::as_bool),
            tags: devices.get("tags").filter(|t| !t.is_null()).cloned(),
            source: SourceInfo {
                instance_id: self.instance_id.clone(),
                subscription_id: subscription_id.map(ToOwned::to_owned),
            },
        };

        serialize_line(&event)
    }

    /// Serialize a malformed event to NDJSON bytes. The ledger is not
    /// touched.
    pub fn transform_malformed(
        &self,
        malformed: &MalformedEvent,
    ) -> Result<Vec<u8>, serde_json::Error> {
        serialize_line(malformed)
    }
}

fn serialize_line<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// Walk nested objects, returning `None` on any missing key or null.
fn safe_get<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.as_object()?.get(*key)?;
        if current.is_null() {
            return None;
        }
    }
    Some(current)
}
