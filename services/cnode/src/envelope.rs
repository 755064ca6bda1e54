//! The message envelope published for every capture.
//!
//! An envelope is a CBOR map with exactly three entries, always in this order:
//!
//! | key        | CBOR type   | value                                 |
//! |------------|-------------|---------------------------------------|
//! | `cnode_id` | text string | node identifier from configuration    |
//! | `created`  | text string | UTC encode time, `YYYY-MM-DDTHH:MM:SSZ` |
//! | `frame`    | byte string | encoded still image, inserted as-is   |

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Timestamp layout of the `created` field.
pub const CREATED_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Errors that can occur while building an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Node identifier is empty")]
    EmptyNodeId,

    #[error("Frame is empty")]
    EmptyFrame,

    #[error("Failed to serialize envelope: {0}")]
    Serialization(String),
}

/// Source of the envelope timestamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Wire form of the envelope. Field order is the CBOR map order.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    cnode_id: &'a str,
    created: String,
    #[serde(with = "serde_bytes")]
    frame: &'a [u8],
}

/// Serialize one envelope for `frame`, stamped with `created_at`.
pub fn build_envelope(
    node_id: &str,
    frame: &[u8],
    created_at: DateTime<Utc>,
) -> Result<Bytes, EnvelopeError> {
    if node_id.is_empty() {
        return Err(EnvelopeError::EmptyNodeId);
    }
    if frame.is_empty() {
        return Err(EnvelopeError::EmptyFrame);
    }

    let envelope = Envelope {
        cnode_id: node_id,
        created: created_at.format(CREATED_FORMAT).to_string(),
        frame,
    };

    let mut buf = Vec::with_capacity(frame.len() + 64);
    ciborium::into_writer(&envelope, &mut buf)
        .map_err(|e| EnvelopeError::Serialization(e.to_string()))?;

    Ok(Bytes::from(buf))
}

/// Builds envelopes for one node, timestamped by a [`Clock`].
#[derive(Clone)]
pub struct EnvelopeBuilder {
    node_id: String,
    clock: Arc<dyn Clock>,
}

impl EnvelopeBuilder {
    pub fn new(node_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            node_id: node_id.into(),
            clock,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Build the envelope for `frame`, stamped with the current clock time.
    pub fn build(&self, frame: &[u8]) -> Result<Bytes, EnvelopeError> {
        let created_at = self.clock.now();
        let payload = build_envelope(&self.node_id, frame, created_at)?;

        debug!(
            node_id = %self.node_id,
            frame_bytes = frame.len(),
            envelope_bytes = payload.len(),
            created = %created_at.format(CREATED_FORMAT),
            "Envelope built"
        );

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ciborium::value::Value;

    const FRAME: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];

    fn new_year() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn decode(bytes: &[u8]) -> Vec<(Value, Value)> {
        match ciborium::from_reader::<Value, _>(bytes).unwrap() {
            Value::Map(entries) => entries,
            other => panic!("expected a map, got {:?}", other),
        }
    }

    #[test]
    fn test_envelope_keys_in_order() {
        let bytes = build_envelope("1", FRAME, new_year()).unwrap();
        let entries = decode(&bytes);

        assert_eq!(
            entries,
            vec![
                (Value::Text("cnode_id".into()), Value::Text("1".into())),
                (
                    Value::Text("created".into()),
                    Value::Text("2024-01-01T00:00:00Z".into())
                ),
                (Value::Text("frame".into()), Value::Bytes(FRAME.to_vec())),
            ]
        );
    }

    #[test]
    fn test_envelope_is_deterministic() {
        let a = build_envelope("node-a", FRAME, new_year()).unwrap();
        let b = build_envelope("node-a", FRAME, new_year()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_envelope_prefix_bytes() {
        let bytes = build_envelope("1", FRAME, new_year()).unwrap();
        // map(3), text(8) "cnode_id"
        assert_eq!(bytes[0], 0xA3);
        assert_eq!(&bytes[1..10], b"\x68cnode_id");
    }

    #[test]
    fn test_empty_frame_rejected() {
        let err = build_envelope("1", &[], new_year()).unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptyFrame));
    }

    #[test]
    fn test_empty_node_id_rejected() {
        let err = build_envelope("", FRAME, new_year()).unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptyNodeId));
    }

    #[test]
    fn test_builder_uses_clock() {
        let clock = FixedClock(Utc.with_ymd_and_hms(2025, 6, 30, 23, 59, 58).unwrap());
        let builder = EnvelopeBuilder::new("edge-7", Arc::new(clock));
        let entries = decode(&builder.build(FRAME).unwrap());

        assert_eq!(entries[0].1, Value::Text("edge-7".into()));
        assert_eq!(entries[1].1, Value::Text("2025-06-30T23:59:58Z".into()));
    }

    #[test]
    fn test_created_drops_subseconds() {
        let at = Utc
            .with_ymd_and_hms(2024, 1, 1, 12, 30, 45)
            .unwrap()
            .checked_add_signed(chrono::Duration::milliseconds(999))
            .unwrap();
        let entries = decode(&build_envelope("1", FRAME, at).unwrap());
        assert_eq!(entries[1].1, Value::Text("2024-01-01T12:30:45Z".into()));
    }
}
