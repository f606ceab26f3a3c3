//! Periodic progress reporting.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::rate_limited::Process;
use crate::event::{Offset, PartitionKey};
use crate::learner::LearnerPhase;

/// Snapshot of how the trainer is doing, served on `/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerStatus {
    pub phase: LearnerPhase,
    pub examples_learned: u64,
    pub learn_failures: u64,
    /// Events learned since the last checkpoint.
    pub pending_trackback: usize,
    pub checkpoints_created: u64,
    /// Last checkpoint completely written.
    pub last_checkpoint: Option<String>,
    pub model_id: Option<String>,
    pub model_name: Option<String>,
    pub partition_offsets: BTreeMap<PartitionKey, Offset>,
}

/// Logs each status and publishes it for the web server.
pub struct StatsReporter {
    published: watch::Sender<Option<TrainerStatus>>,
}

impl StatsReporter {
    pub fn new() -> (Self, watch::Receiver<Option<TrainerStatus>>) {
        let (published, rx) = watch::channel(None);
        (Self { published }, rx)
    }
}

#[async_trait]
impl Process<TrainerStatus> for StatsReporter {
    async fn process(
        &mut self,
        status: TrainerStatus,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!(
            "Learned {} examples ({} failed), {} pending checkpoint, last checkpoint {}",
            status.examples_learned,
            status.learn_failures,
            status.pending_trackback,
            status.last_checkpoint.as_deref().unwrap_or("none")
        );
        self.published.send_replace(Some(status));
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn publishes_latest_status() {
    use std::time::Duration;

    use super::rate_limited::RateLimitedPipeline;

    let (reporter, rx) = StatsReporter::new();
    let pipeline = RateLimitedPipeline::spawn("stats", Duration::from_secs(5), reporter);
    for examples_learned in 1..=10 {
        pipeline.push(TrainerStatus {
            phase: LearnerPhase::Learning,
            examples_learned,
            learn_failures: 0,
            pending_trackback: examples_learned as usize,
            checkpoints_created: 0,
            last_checkpoint: None,
            model_id: None,
            model_name: None,
            partition_offsets: BTreeMap::new(),
        });
    }
    assert_eq!(*rx.borrow(), None);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(rx.borrow().as_ref().map(|s| s.examples_learned), Some(10));
    pipeline.close().await;
}
