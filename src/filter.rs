//! Event filtering by RTK connection status and device identity.
//!
//! Filter chain, evaluated in order, first match wins:
//! 1. `services.rtk.connectionStatus` ∈ `drop_states` → drop
//! 2. `id` ∈ `drop_device_ids` → drop
//! 3. `keep_device_ids` non-empty and `id` ∉ it → drop
//! 4. Otherwise → pass
//!
//! A missing connection status never drops; filtering only fires on
//! observed states.

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use crate::config::FilterConfig;

/// Stateless filter that decides whether a device event passes through.
pub struct EventFilter {
    drop_states: HashSet<String>,
    drop_device_ids: HashSet<String>,
    keep_device_ids: HashSet<String>,
}

impl EventFilter {
    pub fn new(config: &FilterConfig) -> Self {
        EventFilter {
            drop_states: config.drop_states.iter().cloned().collect(),
            drop_device_ids: config.drop_device_ids.iter().cloned().collect(),
            keep_device_ids: config.keep_device_ids.iter().cloned().collect(),
        }
    }

    /// Evaluate the filter chain; returns the input unchanged when it
    /// passes, `None` when filtered.
    pub fn apply<'a>(&self, devices: &'a Value) -> Option<&'a Value> {
        let device_id = devices.get("id").and_then(Value::as_str).unwrap_or("");

        if let Some(status) = connection_status(devices) {
            if self.drop_states.contains(status) {
                debug!(device_id, status, "filtered: state in drop_states");
                return None;
            }
        }

        if self.drop_device_ids.contains(device_id) {
            debug!(device_id, "filtered: in drop_device_ids");
            return None;
        }

        if !self.keep_device_ids.is_empty() && !self.keep_device_ids.contains(device_id) {
            debug!(device_id, "filtered: not in keep_device_ids");
            return None;
        }

        Some(devices)
    }
}

fn connection_status(devices: &Value) -> Option<&str> {
    devices
        .get("services")?
        .get("rtk")?
        .get("connectionStatus")?
        .as_str()
}
