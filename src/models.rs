//! Output record types for the NDJSON event stream.
//!
//! Field declaration order is the serialization order; downstream
//! shippers rely on `event_type` leading every line.

use serde::{Deserialize, Serialize};

/// Provenance metadata attached to every output record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub instance_id: String,
    pub subscription_id: Option<String>,
}

/// A device RTK connection-status transition.
///
/// Emitted for every valid device payload that passes the filter, whether
/// or not the status actually changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub event_type: String,
    pub timestamp: Option<String>,
    pub received_at: String,
    pub device_id: String,
    pub device_label: Option<String>,
    pub previous_state: Option<String>,
    pub current_state: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude_m: Option<f64>,
    pub rtk_enabled: Option<bool>,
    pub tags: Option<serde_json::Value>,
    pub source: SourceInfo,
}

/// Why a message failed classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The raw frame was not valid JSON.
    ParseError,
    /// The `payload.data.devices` path was missing or not an object.
    SchemaMismatch,
    /// The device object lacked the required `id` field.
    MissingFields,
}

/// Structured error information for malformed events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    /// Raw payload preserved for diagnosis, capped at 4096 UTF-8 bytes.
    pub raw_payload: String,
    pub raw_payload_truncated: bool,
}

/// Wrapper for messages that fail classification.
///
/// These are never silently dropped; they appear in the NDJSON output
/// alongside normal events so operators can monitor data quality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedEvent {
    pub event_type: String,
    pub timestamp: String,
    pub received_at: String,
    pub error: ErrorDetail,
    pub source: SourceInfo,
}
