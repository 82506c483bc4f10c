//! Domain types for the orchestration core
//!
//! Strongly-typed identifiers and bounded numeric values used across the
//! support registry, broker, deployer, and coordinator. Newtypes prevent
//! primitive obsession at the component seams.

use nutype::nutype;
use uuid::Uuid;

/// Unique identifier of a broker message
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier of a running agent instance (e.g. `planner-1`)
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct AgentInstanceId(String);

/// Identifier of an agent type template (e.g. `planner`)
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct AgentTypeId(String);

/// Identifier of a declared cell
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct CellId(String);

/// Logical project scope shared by cooperating agents
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct ProjectId(String);

/// Named delivery channel on the broker
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct TopicName(String);

/// Identifier of a coordinator-scoped request
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct RequestId(String);

/// Bounded capacity of a subscriber's inbound delivery queue
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct QueueCapacity(usize);

impl QueueCapacity {
    /// Gets the value as usize
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Upper bound on plan-execute-verify iterations per request
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 64),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct MaxIterations(u32);

impl MaxIterations {
    /// Gets the value as u32
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Bounded retry count for process restarts
#[nutype(
    validate(less_or_equal = 16),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 3
)]
pub struct RestartLimit(u32);

impl RestartLimit {
    /// Gets the value as u32
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_validation() {
        assert!(AgentInstanceId::try_new("planner-1".to_string()).is_ok());
        assert!(AgentInstanceId::try_new(String::new()).is_err());
        assert!(AgentInstanceId::try_new("x".repeat(200)).is_err());
    }

    #[test]
    fn test_topic_name_roundtrips_through_string() {
        let topic = TopicName::try_new("pev.plan.request".to_string()).unwrap();
        assert_eq!(topic.to_string(), "pev.plan.request");
        let back: String = topic.into();
        assert_eq!(back, "pev.plan.request");
    }

    #[test]
    fn test_queue_capacity_bounds() {
        assert!(QueueCapacity::try_new(0).is_err());
        assert!(QueueCapacity::try_new(4).is_ok());
        assert!(QueueCapacity::try_new(2_000_000).is_err());
    }

    #[test]
    fn test_message_id_uniqueness() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
    }
}
