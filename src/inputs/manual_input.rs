use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;

use super::{EventSource, ResumeFilter};
use crate::errors::InputError;
use crate::event::{DecisionEvent, Offset, PartitionKey};

/// Replays a fixed list of events.
pub struct ManualInput {
    events: VecDeque<DecisionEvent>,
    resume: ResumeFilter,
    skipped: usize,
}

impl ManualInput {
    pub fn new(events: impl IntoIterator<Item = DecisionEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
            resume: ResumeFilter::default(),
            skipped: 0,
        }
    }

    /// How many events were dropped by [`EventSource::seek`].
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

#[async_trait]
impl EventSource for ManualInput {
    fn seek(&mut self, offsets: &BTreeMap<PartitionKey, Offset>) {
        self.resume.seek(offsets);
    }

    async fn next(&mut self) -> Result<Option<DecisionEvent>, InputError> {
        while let Some(event) = self.events.pop_front() {
            if self.resume.skip(&event) {
                self.skipped += 1;
                continue;
            }
            return Ok(Some(event));
        }
        Ok(None)
    }
}

#[tokio::test]
async fn replays_after_seek() {
    use crate::learner::test_event;

    let mut input = ManualInput::new(vec![
        test_event("e1", "a", 1),
        test_event("e2", "b", 1),
        test_event("e3", "a", 2),
    ]);
    input.seek(&BTreeMap::from([(PartitionKey::from("a"), Offset(1))]));

    assert_eq!(input.next().await.unwrap().unwrap().event_id, "e2");
    assert_eq!(input.next().await.unwrap().unwrap().event_id, "e3");
    assert!(input.next().await.unwrap().is_none());
    assert_eq!(input.skipped(), 1);
}
