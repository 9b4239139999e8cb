//! EventEnvelope - the wire format every published event travels in.
//!
//! ```json
//! {"event_type": "region.created", "occurred_at": "2024-01-01T12:00:00Z",
//!  "service_name": "location-service", "payload": {"id": 1}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content type stamped on every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Errors from encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to serialize event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Envelope wrapping an event payload with its type, origin, and timestamp.
///
/// Created once at publish time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub service_name: String,

    /// Event-specific JSON. A missing field decodes as `null`.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Wrap a serializable payload.
    ///
    /// Fails only when `payload` cannot be represented as JSON
    /// (e.g. a map with non-string keys).
    pub fn wrap<T: Serialize + ?Sized>(
        event_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
        service_name: impl Into<String>,
        payload: &T,
    ) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_value(payload).map_err(EnvelopeError::Encode)?;
        Ok(Self {
            event_type: event_type.into(),
            occurred_at,
            service_name: service_name.into(),
            payload,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
    }

    /// The payload re-serialized as standalone JSON bytes (what handlers receive).
    pub fn payload_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(&self.payload).map_err(EnvelopeError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;

    fn at_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn wire_format_uses_snake_case_fields_and_rfc3339() {
        let env = EventEnvelope::wrap(
            "region.created",
            at_noon(),
            "location-service",
            &json!({ "id": 1, "name": "North" }),
        )
        .unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(raw["event_type"], "region.created");
        assert_eq!(raw["service_name"], "location-service");
        assert_eq!(raw["occurred_at"], "2024-01-01T12:00:00Z");
        assert_eq!(raw["payload"]["name"], "North");
    }

    #[test]
    fn decode_accepts_offsets_and_missing_payload() {
        let bytes = br#"{"event_type":"city.updated","occurred_at":"2024-01-01T15:00:00+03:00","service_name":"geo"}"#;
        let env = EventEnvelope::decode(bytes).unwrap();
        assert_eq!(env.occurred_at, at_noon());
        assert_eq!(env.payload, serde_json::Value::Null);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = EventEnvelope::decode(b"not json at all").unwrap_err();
        assert!(matches!(err, EnvelopeError::Decode(_)));
    }

    #[test]
    fn wrap_rejects_non_string_map_keys() {
        let mut bad = HashMap::new();
        bad.insert((1, 2), "tuple keys are not JSON");
        let err = EventEnvelope::wrap("x", at_noon(), "svc", &bad).unwrap_err();
        assert!(matches!(err, EnvelopeError::Encode(_)));
    }

    #[test]
    fn payload_bytes_is_only_the_payload() {
        let env = EventEnvelope::wrap("k", at_noon(), "svc", &json!([1, 2, 3])).unwrap();
        assert_eq!(env.payload_bytes().unwrap(), b"[1,2,3]");
    }
}
