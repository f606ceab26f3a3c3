//! Where decision events come from.
//!
//! An [`EventSource`] yields events in order per partition and may
//! deliver an event more than once. After recovery it is told the
//! recovered offsets with [`EventSource::seek`] and from then on skips
//! every event at or before its partition's offset.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::InputConfig;
use crate::errors::InputError;
use crate::event::{DecisionEvent, Offset, PartitionKey};
use crate::metrics::TrainerMetrics;

pub mod jsonl_input;
pub mod manual_input;

pub use jsonl_input::JsonLinesInput;
pub use manual_input::ManualInput;

#[async_trait]
pub trait EventSource: Send {
    /// Resume after these offsets.
    fn seek(&mut self, offsets: &BTreeMap<PartitionKey, Offset>);

    /// The next event, or `None` once the stream has ended.
    async fn next(&mut self) -> Result<Option<DecisionEvent>, InputError>;
}

/// Drops events which were already learned before a restart.
#[derive(Debug, Default)]
pub struct ResumeFilter {
    offsets: BTreeMap<PartitionKey, Offset>,
}

impl ResumeFilter {
    pub fn seek(&mut self, offsets: &BTreeMap<PartitionKey, Offset>) {
        for (partition, offset) in offsets {
            tracing::info!("Resuming partition {partition} after offset {}", offset.0);
        }
        self.offsets = offsets.clone();
    }

    /// Should `event` be skipped?
    pub fn skip(&self, event: &DecisionEvent) -> bool {
        self.offsets
            .get(&event.partition)
            .map_or(false, |resume| event.offset <= *resume)
    }
}

pub fn build_input(
    config: &InputConfig,
    metrics: Arc<TrainerMetrics>,
) -> Result<Box<dyn EventSource>, InputError> {
    let input: Box<dyn EventSource> = match config {
        InputConfig::File { path } => Box::new(JsonLinesInput::open(path, metrics)?),
        InputConfig::Stdin => Box::new(JsonLinesInput::stdin(metrics)),
    };
    Ok(input)
}

#[test]
fn resume_filter_works() {
    use crate::learner::test_event;

    let mut filter = ResumeFilter::default();
    assert!(!filter.skip(&test_event("e1", "a", 0)));

    let offsets = BTreeMap::from([(PartitionKey::from("a"), Offset(5))]);
    filter.seek(&offsets);
    assert!(filter.skip(&test_event("e1", "a", 4)));
    assert!(filter.skip(&test_event("e1", "a", 5)));
    assert!(!filter.skip(&test_event("e1", "a", 6)));
    assert!(!filter.skip(&test_event("e1", "b", 0)));
}
