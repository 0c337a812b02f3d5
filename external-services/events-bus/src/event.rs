// Event kinds and the wire envelope shared by every service
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EventBusError, Result};

/// Closed set of cross-service events.
///
/// The serialized name doubles as the routing key, so it must be identical
/// in every service that links this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    UserCreated,
    UserUpdated,
    UserDeleted,
    TrainingCreated,
    TrainingUpdated,
    ReferenceDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::UserCreated,
        EventKind::UserUpdated,
        EventKind::UserDeleted,
        EventKind::TrainingCreated,
        EventKind::TrainingUpdated,
        EventKind::ReferenceDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UserCreated => "USER_CREATED",
            EventKind::UserUpdated => "USER_UPDATED",
            EventKind::UserDeleted => "USER_DELETED",
            EventKind::TrainingCreated => "TRAINING_CREATED",
            EventKind::TrainingUpdated => "TRAINING_UPDATED",
            EventKind::ReferenceDeleted => "REFERENCE_DELETED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EventBusError::Config(format!("unknown event kind: {s}")))
    }
}

/// The canonical message carried on the broker.
///
/// Topology is never stored here; the routing table resolves it from `kind`
/// at publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    kind: EventKind,
    payload: serde_json::Value,
    occurred_at: i64,
    delivery_id: Uuid,
}

impl Envelope {
    /// Stamp a new envelope with the current time and a fresh delivery id.
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            occurred_at: Utc::now().timestamp_millis(),
            delivery_id: Uuid::new_v4(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }

    /// Epoch milliseconds set by the publisher.
    pub fn occurred_at_millis(&self) -> i64 {
        self.occurred_at
    }

    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.occurred_at).single()
    }

    pub fn delivery_id(&self) -> Uuid {
        self.delivery_id
    }

    /// Decode the payload into the typed contract the consuming service
    /// expects for this kind.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Payload of the `USER_*` events emitted by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub user_id: String,
}

/// Payload of `REFERENCE_DELETED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRef {
    pub id: i64,
}

/// Payload of the `TRAINING_*` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRef {
    pub id: i64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub training_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_names_match_wire_names() {
        for kind in EventKind::ALL {
            let wire = serde_json::to_value(kind).unwrap();
            assert_eq!(wire, json!(kind.as_str()));
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("USER_RENAMED".parse::<EventKind>().is_err());
    }

    #[test]
    fn envelope_uses_camel_case_fields() {
        let envelope = Envelope::new(EventKind::TrainingCreated, json!({ "id": 42, "type": "free" }));
        let wire: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();

        assert_eq!(wire["kind"], "TRAINING_CREATED");
        assert_eq!(wire["payload"]["id"], 42);
        assert!(wire["occurredAt"].is_i64());
        assert_eq!(wire["deliveryId"], envelope.delivery_id().to_string());
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let raw = json!({
            "kind": "USER_DELETED",
            "payload": { "userId": "u-1" },
            "occurredAt": 1_700_000_000_000_i64,
            "deliveryId": "4b1e9a0e-8c52-4a8e-9d0c-2f3b3c1f8e11",
            "traceparent": "00-abc-def-01"
        });
        let envelope = Envelope::decode(raw.to_string().as_bytes()).unwrap();

        assert_eq!(envelope.kind(), EventKind::UserDeleted);
        assert_eq!(envelope.payload_as::<UserRef>().unwrap().user_id, "u-1");
        assert_eq!(envelope.occurred_at_millis(), 1_700_000_000_000);
    }

    #[test]
    fn decode_rejects_missing_payload_and_unknown_kind() {
        let missing = json!({
            "kind": "USER_DELETED",
            "occurredAt": 1,
            "deliveryId": "4b1e9a0e-8c52-4a8e-9d0c-2f3b3c1f8e11"
        });
        assert!(matches!(
            Envelope::decode(missing.to_string().as_bytes()),
            Err(EventBusError::Serialization(_))
        ));
        assert!(Envelope::decode(b"{\"kind\":\"NOPE\"}").is_err());
        assert!(Envelope::decode(b"not json").is_err());
    }

    #[test]
    fn fresh_envelopes_get_distinct_delivery_ids() {
        let a = Envelope::new(EventKind::UserCreated, json!({}));
        let b = Envelope::new(EventKind::UserCreated, json!({}));
        assert_ne!(a.delivery_id(), b.delivery_id());
    }

    #[test]
    fn training_ref_reads_type_field() {
        let envelope = Envelope::new(EventKind::TrainingCreated, json!({ "id": 42, "type": "free" }));
        let training: TrainingRef = envelope.payload_as().unwrap();
        assert_eq!(training.id, 42);
        assert_eq!(training.training_type.as_deref(), Some("free"));
    }
}
