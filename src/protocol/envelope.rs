//! The routed message envelope and its routing-target expressions

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::{AgentInstanceId, MessageId, TopicName};
use crate::protocol::ProtocolError;

/// Meta key carrying the sender's instance id
pub const META_SENDER: &str = "sender";
/// Meta key carrying the instance id direct replies should be sent to
pub const META_REPLY_TO: &str = "reply_to";

/// The message envelope routed by the broker
///
/// The broker treats `payload` as opaque; per-message-type decoding happens
/// at the agent boundary. `id` is unique within the broker's live window and
/// `timestamp` serializes as an RFC-3339 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    pub payload: Value,
    #[serde(default)]
    pub meta: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Creates an envelope with a fresh id and the current timestamp
    pub fn new(kind: impl Into<String>, target: impl Into<String>, payload: Value) -> Self {
        Self {
            id: MessageId::generate(),
            kind: kind.into(),
            target: target.into(),
            payload,
            meta: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attaches a meta entry, replacing any prior value for the key
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Records the sending instance in meta
    #[must_use]
    pub fn from_sender(self, sender: &AgentInstanceId) -> Self {
        self.with_meta(META_SENDER, Value::String(sender.to_string()))
    }

    /// Instance id direct replies should go to, if the sender declared one
    pub fn reply_to(&self) -> Option<AgentInstanceId> {
        self.meta
            .get(META_REPLY_TO)
            .and_then(Value::as_str)
            .and_then(|s| AgentInstanceId::try_new(s.to_string()).ok())
    }

    /// Parses the routing expression in `target`
    pub fn parsed_target(&self) -> Result<Target, ProtocolError> {
        Target::parse(&self.target)
    }
}

/// A resolved routing expression
///
/// `pub:`/`sub:` and direct instance ids are broker primitives; `file:` and
/// `channel:` are resolved inside the client library and never reach the
/// broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `pub:TOPIC` - publish to every current subscriber of the topic
    Publish(TopicName),
    /// `sub:TOPIC` - declare a subscription to the topic
    Subscribe(TopicName),
    /// `INSTANCE_ID` - direct delivery to one live connection
    Direct(AgentInstanceId),
    /// `file:PATH_TEMPLATE` - library-level append sink
    File(String),
    /// `channel:NAME` - library-level alias for a topic publication
    Channel(TopicName),
}

impl Target {
    /// Parses a routing expression
    pub fn parse(expression: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedTarget {
            expression: expression.to_string(),
        };

        if let Some(topic) = expression.strip_prefix("pub:") {
            let topic = TopicName::try_new(topic.to_string()).map_err(|_| malformed())?;
            return Ok(Self::Publish(topic));
        }
        if let Some(topic) = expression.strip_prefix("sub:") {
            let topic = TopicName::try_new(topic.to_string()).map_err(|_| malformed())?;
            return Ok(Self::Subscribe(topic));
        }
        if let Some(path) = expression.strip_prefix("file:") {
            if path.is_empty() {
                return Err(malformed());
            }
            return Ok(Self::File(path.to_string()));
        }
        if let Some(name) = expression.strip_prefix("channel:") {
            let topic = TopicName::try_new(name.to_string()).map_err(|_| malformed())?;
            return Ok(Self::Channel(topic));
        }
        if expression.contains(':') {
            return Err(malformed());
        }
        let instance = AgentInstanceId::try_new(expression.to_string()).map_err(|_| malformed())?;
        Ok(Self::Direct(instance))
    }

    /// Renders the expression back to its wire form
    pub fn expression(&self) -> String {
        match self {
            Self::Publish(topic) => format!("pub:{topic}"),
            Self::Subscribe(topic) => format!("sub:{topic}"),
            Self::Direct(instance) => instance.to_string(),
            Self::File(path) => format!("file:{path}"),
            Self::Channel(name) => format!("channel:{name}"),
        }
    }
}

/// Substitutes `{id}`, `{type}`, and `{project}` in a channel expression
///
/// Applied at deploy time before an expression is handed to an agent.
pub fn render_expression(template: &str, id: &str, type_id: &str, project: &str) -> String {
    template
        .replace("{id}", id)
        .replace("{type}", type_id)
        .replace("{project}", project)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_target_parses_broker_primitives() {
        assert_eq!(
            Target::parse("pub:tasks").unwrap(),
            Target::Publish(TopicName::try_new("tasks".to_string()).unwrap())
        );
        assert_eq!(
            Target::parse("sub:tasks").unwrap(),
            Target::Subscribe(TopicName::try_new("tasks".to_string()).unwrap())
        );
        assert_eq!(
            Target::parse("planner-1").unwrap(),
            Target::Direct(AgentInstanceId::try_new("planner-1".to_string()).unwrap())
        );
    }

    #[test]
    fn test_target_parses_library_expressions() {
        assert_eq!(
            Target::parse("file:/tmp/out/{id}.json").unwrap(),
            Target::File("/tmp/out/{id}.json".to_string())
        );
        assert_eq!(
            Target::parse("channel:events").unwrap(),
            Target::Channel(TopicName::try_new("events".to_string()).unwrap())
        );
    }

    #[test]
    fn test_target_rejects_malformed_expressions() {
        assert!(Target::parse("pub:").is_err());
        assert!(Target::parse("").is_err());
        assert!(Target::parse("bogus:thing").is_err());
    }

    #[test]
    fn test_expression_rendering_substitutes_runtime_values() {
        let rendered = render_expression("pub:{project}.{type}.{id}", "p1", "planner", "demo");
        assert_eq!(rendered, "pub:demo.planner.p1");
    }

    #[test]
    fn test_envelope_serializes_contract_field_names() {
        let envelope = Envelope::new("user_request", "pub:pev.request", json!({"id": "r1"}));
        let value = serde_json::to_value(&envelope).unwrap();
        for field in ["id", "type", "target", "payload", "meta", "timestamp"] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(value["type"], "user_request");
    }

    #[test]
    fn test_reply_to_meta_round_trips_instance_id() {
        let envelope = Envelope::new("query", "pub:lookups", json!({}))
            .with_meta(META_REPLY_TO, Value::String("coordinator-1".to_string()));
        assert_eq!(
            envelope.reply_to(),
            Some(AgentInstanceId::try_new("coordinator-1".to_string()).unwrap())
        );

        let plain = Envelope::new("query", "pub:lookups", json!({}));
        assert_eq!(plain.reply_to(), None);
    }

    #[test]
    fn test_envelope_timestamp_is_rfc3339() {
        let envelope = Envelope::new("heartbeat", "pub:t", json!({}));
        let value = serde_json::to_value(&envelope).unwrap();
        let raw = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(raw).is_ok());
    }

    proptest! {
        #[test]
        fn prop_envelope_roundtrips_through_codec(
            kind in "[a-z_]{1,20}",
            topic in "[a-z][a-z.]{0,20}",
            key in "[a-z]{1,10}",
            text in ".{0,64}",
        ) {
            let envelope = Envelope::new(kind, format!("pub:{topic}"), json!({ key.clone(): text }));
            let bytes = serde_json::to_vec(&envelope).unwrap();
            let back: Envelope = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(envelope, back);
        }

        #[test]
        fn prop_target_expression_roundtrips(topic in "[a-z][a-z.]{0,30}") {
            for expr in [format!("pub:{topic}"), format!("sub:{topic}"), format!("channel:{topic}")] {
                let target = Target::parse(&expr).unwrap();
                prop_assert_eq!(target.expression(), expr);
            }
        }
    }
}
