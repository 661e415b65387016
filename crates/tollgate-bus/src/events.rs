//! Wire envelope and the typed events exchanged between bounded contexts.
//!
//! Field names are PascalCase on the wire; timestamps are RFC 3339.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tollgate_core::MAX_EVENT_TYPE_LEN;

use crate::error::BusError;

/// Transport envelope: `{Id, Payload, Published, EventType}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventEnvelope {
    /// Assigned by the transport; 0 until produced.
    pub id: i64,
    /// JSON document whose schema depends on `event_type`.
    pub payload: String,
    pub published: bool,
    pub event_type: String,
}

impl EventEnvelope {
    /// Wrap an already encoded payload.
    pub fn new(event_type: impl Into<String>, payload: impl Into<String>) -> Result<Self, BusError> {
        let event_type = event_type.into();
        if event_type.len() > MAX_EVENT_TYPE_LEN {
            return Err(BusError::EventTypeTooLong(event_type.len()));
        }
        Ok(Self {
            id: 0,
            payload: payload.into(),
            published: false,
            event_type,
        })
    }

    /// Encode a typed event.
    pub fn from_event<E: Event>(event: &E) -> Result<Self, BusError> {
        Self::new(E::EVENT_TYPE, serde_json::to_string(event)?)
    }

    /// Whether this envelope carries an `E`.
    #[inline]
    pub fn is<E: Event>(&self) -> bool {
        self.event_type == E::EVENT_TYPE
    }

    /// Decode the payload as `E`.
    pub fn decode<E: Event>(&self) -> Result<E, BusError> {
        if !self.is::<E>() {
            return Err(BusError::Codec(format!(
                "expected {}, got {}",
                E::EVENT_TYPE,
                self.event_type
            )));
        }
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// A payload type with a fixed event type tag.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
}

/// Bytes a user moved through one proxy connection since the last report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserConsumedTraffic {
    pub user_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Upstream to client.
    pub in_bytes: u64,
    /// Client to upstream.
    pub out_bytes: u64,
}

impl Event for UserConsumedTraffic {
    const EVENT_TYPE: &'static str = "UserConsumedTraffic";
}

/// Traffic reported for a user without an active plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserConsumedTrafficWithoutPlan {
    pub user_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Event for UserConsumedTrafficWithoutPlan {
    const EVENT_TYPE: &'static str = "UserConsumedTrafficWithoutPlan";
}

/// A user's accumulated traffic crossed its plan limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserExceededTrafficLimit {
    pub user_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Event for UserExceededTrafficLimit {
    const EVENT_TYPE: &'static str = "UserExceededTrafficLimit";
}

/// A user's password changed; cached verdicts must go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserPasswordChangedEvent {
    pub username: String,
}

impl Event for UserPasswordChangedEvent {
    const EVENT_TYPE: &'static str = "UserPasswordChangedEvent";
}

/// Billing assigned a plan to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlanAssigned {
    pub user_email: String,
    pub plan_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Event for PlanAssigned {
    const EVENT_TYPE: &'static str = "PlanAssigned";
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn envelope_wire_format() {
        let env = EventEnvelope::from_event(&UserPasswordChangedEvent {
            username: "alice".into(),
        })
        .unwrap();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "Id": 0,
                "Payload": "{\"Username\":\"alice\"}",
                "Published": false,
                "EventType": "UserPasswordChangedEvent",
            })
        );
    }

    #[test]
    fn traffic_payload_fields() {
        let event = UserConsumedTraffic {
            user_id: 7,
            timestamp: datetime!(2026-03-01 12:00:00 UTC),
            in_bytes: 2000,
            out_bytes: 1000,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["UserId"], 7);
        assert_eq!(json["InBytes"], 2000);
        assert_eq!(json["OutBytes"], 1000);
        assert_eq!(json["Timestamp"], "2026-03-01T12:00:00Z");
    }

    #[test]
    fn decode_checks_event_type() {
        let env = EventEnvelope::from_event(&UserExceededTrafficLimit {
            user_id: 3,
            timestamp: datetime!(2026-03-01 00:00:00 UTC),
        })
        .unwrap();
        assert!(env.is::<UserExceededTrafficLimit>());
        assert_eq!(env.decode::<UserExceededTrafficLimit>().unwrap().user_id, 3);
        assert!(matches!(
            env.decode::<UserConsumedTrafficWithoutPlan>(),
            Err(BusError::Codec(_))
        ));
    }

    #[test]
    fn decodes_foreign_plan_assigned() {
        let env = EventEnvelope::new(
            "PlanAssigned",
            r#"{"UserEmail":"bob@example.com","PlanId":4,"Timestamp":"2026-02-28T23:59:59+01:00"}"#,
        )
        .unwrap();
        let plan = env.decode::<PlanAssigned>().unwrap();
        assert_eq!(plan.user_email, "bob@example.com");
        assert_eq!(plan.plan_id, 4);
    }

    #[test]
    fn rejects_long_event_type() {
        let long = "x".repeat(MAX_EVENT_TYPE_LEN + 1);
        assert!(matches!(
            EventEnvelope::new(long, "{}"),
            Err(BusError::EventTypeTooLong(101))
        ));
    }
}
