use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::{Offset, PartitionKey};

/// Snapshot of how far the trainer got.
///
/// Owned and mutated only by the [`crate::learner::Learner`]; written
/// verbatim as JSON into every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Offset of the last learned event, per partition.
    #[serde(default)]
    pub partition_offsets: BTreeMap<PartitionKey, Offset>,
    /// Storage name of the model this state belongs to.
    #[serde(default)]
    pub model_name: Option<String>,
}

impl TrainerState {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Has the event at `offset` in `partition` already been learned?
    pub fn is_learned(&self, partition: &PartitionKey, offset: Offset) -> bool {
        self.partition_offsets
            .get(partition)
            .map_or(false, |learned| offset <= *learned)
    }
}

#[test]
fn state_json_works() {
    let mut state = TrainerState::default();
    state.partition_offsets.insert("0".into(), Offset(5));
    state.partition_offsets.insert("1".into(), Offset(2));
    state.model_name = Some("20240101/000000/model".to_owned());

    let bytes = state.to_bytes().unwrap();
    assert_eq!(
        std::str::from_utf8(&bytes).unwrap(),
        r#"{"partition_offsets":{"0":5,"1":2},"model_name":"20240101/000000/model"}"#
    );
    assert_eq!(TrainerState::from_bytes(&bytes).unwrap(), state);
    assert_eq!(
        TrainerState::from_bytes(b"{}").unwrap(),
        TrainerState::default()
    );
}

#[test]
fn is_learned_works() {
    let mut state = TrainerState::default();
    state.partition_offsets.insert("0".into(), Offset(5));
    assert!(state.is_learned(&"0".into(), Offset(5)));
    assert!(!state.is_learned(&"0".into(), Offset(6)));
    assert!(!state.is_learned(&"1".into(), Offset(0)));
}
