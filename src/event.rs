//! Decision events as they arrive on the event stream.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// IDs a logical sub-stream of the event stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(pub String);

impl Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

/// Read position within a partition.
///
/// Offsets are only comparable within the same partition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(pub u64);

/// The outcome that was logged for a decision.
///
/// Actions are numbered from 1.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub action: u32,
    pub probability: f32,
    pub cost: f32,
}

/// A decision joined with its observed outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub event_id: String,
    pub partition: PartitionKey,
    pub offset: Offset,
    pub timestamp: DateTime<Utc>,
    /// Number of actions that were available for this decision.
    pub actions: u32,
    /// Free-form context features.
    #[serde(default)]
    pub context: serde_json::Value,
    pub label: Label,
}

#[test]
fn partition_key_is_transparent() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(&PartitionKey("p-1".to_owned()), &[Token::Str("p-1")]);
    assert_tokens(&Offset(42), &[Token::U64(42)]);
}
