//! The task which owns a [`Learner`].
//!
//! Architecture
//! ------------
//!
//! All events go through one bounded queue into one task, which is
//! the only thing that ever touches the [`Learner`]. For each event it:
//!
//! 1. learns it;
//!
//! 2. hands the result to the evaluation pipeline, waiting if that is
//!    backed up;
//!
//! 3. if the checkpoint policy says so, snapshots a checkpoint and
//!    queues it for the background writer without waiting;
//!
//! 4. offers a status snapshot to the stats reporter.
//!
//! A timer tick checkpoints too if there is anything new. When the
//! input queue closes, the task takes a last checkpoint if configured,
//! then drains the checkpoint writer and the evaluation pipeline and
//! hands the [`Learner`] back.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Learner;
use crate::checkpoint::CheckpointWriterHandle;
use crate::event::DecisionEvent;
use crate::pipeline::evaluation::EvaluationPipeline;
use crate::pipeline::rate_limited::RateLimitedPipeline;
use crate::pipeline::stats::TrainerStatus;

/// Everything the learner task drives besides the [`Learner`].
pub struct LearnerWorker {
    pub checkpoints: CheckpointWriterHandle,
    pub evaluation: Option<EvaluationPipeline>,
    pub evaluation_shutdown_timeout: Duration,
    pub stats: Option<RateLimitedPipeline<TrainerStatus>>,
    /// Timed checkpoint interval.
    pub tick: Option<Duration>,
    pub checkpoint_on_shutdown: bool,
}

impl LearnerWorker {
    fn checkpoint(&self, learner: &mut Learner) {
        if let Some(payload) = learner.checkpoint() {
            self.checkpoints.submit(payload);
        }
    }

    fn report(&self, learner: &Learner) {
        if let Some(stats) = &self.stats {
            let mut status = learner.status();
            status.last_checkpoint = self
                .checkpoints
                .last_written()
                .map(|path| path.to_string());
            stats.push(status);
        }
    }

    async fn learn(&self, learner: &mut Learner, event: DecisionEvent) {
        if let Some(result) = learner.learn(&event) {
            if let Some(evaluation) = &self.evaluation {
                evaluation.push(result).await;
            }
        }
        if learner.should_checkpoint() {
            self.checkpoint(learner);
        }
        self.report(learner);
    }

    async fn run(self, mut learner: Learner, mut rx: mpsc::Receiver<DecisionEvent>) -> Learner {
        let mut ticker = self.tick.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let event = match ticker.as_mut() {
                Some(ticker) => tokio::select! {
                    event = rx.recv() => event,
                    _ = ticker.tick() => {
                        if learner.should_checkpoint_on_tick() {
                            tracing::debug!("Timed checkpoint");
                            self.checkpoint(&mut learner);
                            self.report(&learner);
                        }
                        continue;
                    }
                },
                None => rx.recv().await,
            };
            match event {
                Some(event) => self.learn(&mut learner, event).await,
                None => break,
            }
        }

        if self.checkpoint_on_shutdown && learner.examples_since_checkpoint() > 0 {
            tracing::info!("Taking shutdown checkpoint");
            self.checkpoint(&mut learner);
        }
        self.report(&learner);

        let LearnerWorker {
            checkpoints,
            evaluation,
            evaluation_shutdown_timeout,
            stats,
            ..
        } = self;
        checkpoints.close().await;
        if let Some(evaluation) = evaluation {
            evaluation.stop(evaluation_shutdown_timeout).await;
        }
        if let Some(stats) = stats {
            stats.close().await;
        }
        learner
    }
}

/// Send events to a running learner task.
pub struct LearnerHandle {
    tx: mpsc::Sender<DecisionEvent>,
    task: JoinHandle<Learner>,
}

impl LearnerHandle {
    pub fn spawn(learner: Learner, worker: LearnerWorker, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let task = tokio::spawn(worker.run(learner, rx));
        Self { tx, task }
    }

    /// Queue an event; waits while the learner is backed up.
    ///
    /// Returns `false` if the learner task is gone.
    pub async fn learn(&self, event: DecisionEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Learn everything queued, shut down, and return the learner.
    pub async fn stop(self) -> Result<Learner, tokio::task::JoinError> {
        drop(self.tx);
        self.task.await
    }
}

#[cfg(test)]
fn test_worker(
    store: std::sync::Arc<crate::storage::InMemStore>,
    checkpoint_on_shutdown: bool,
) -> LearnerWorker {
    use std::sync::Arc;

    use crate::checkpoint::CheckpointWriter;
    use crate::metrics::TrainerMetrics;

    LearnerWorker {
        checkpoints: CheckpointWriterHandle::spawn(
            CheckpointWriter::new(store),
            4,
            Duration::from_secs(5),
            Arc::new(TrainerMetrics::detached()),
        ),
        evaluation: None,
        evaluation_shutdown_timeout: Duration::from_secs(1),
        stats: None,
        tick: None,
        checkpoint_on_shutdown,
    }
}

#[tokio::test]
async fn checkpoints_on_threshold() {
    use std::sync::Arc;

    use super::{test_context, test_event};
    use crate::checkpoint::{Trackback, TrainerState, LATEST_STATE};
    use crate::storage::{InMemStore, ObjectStore};

    let store = Arc::new(InMemStore::new());
    let learner = Learner::fresh_start(&test_context(2)).unwrap();
    let handle = LearnerHandle::spawn(learner, test_worker(store.clone(), false), 16);
    for i in 0..5 {
        assert!(handle.learn(test_event(&format!("e{i}"), "0", i)).await);
    }
    let learner = handle.stop().await.unwrap();

    // Two checkpoints of two events; the fifth is still pending.
    assert_eq!(learner.trackback(), ["e4".to_owned()]);
    let state = TrainerState::from_bytes(&store.get(LATEST_STATE).await.unwrap().unwrap()).unwrap();
    assert_eq!(state.partition_offsets.values().next().map(|o| o.0), Some(3));

    let mut seen = Vec::new();
    for name in store.list("").await.unwrap() {
        if name.ends_with("/model.trackback") {
            let bytes = store.get(&name).await.unwrap().unwrap();
            seen.extend(Trackback::parse(&bytes).unwrap().event_ids);
        }
    }
    seen.sort();
    assert_eq!(seen, vec!["e0", "e1", "e2", "e3"]);
}

#[tokio::test]
async fn checkpoints_on_shutdown() {
    use std::sync::Arc;

    use super::{test_context, test_event};
    use crate::checkpoint::{TrainerState, LATEST_STATE};
    use crate::storage::{InMemStore, ObjectStore};

    let store = Arc::new(InMemStore::new());
    let learner = Learner::fresh_start(&test_context(100)).unwrap();
    let handle = LearnerHandle::spawn(learner, test_worker(store.clone(), true), 16);
    handle.learn(test_event("e1", "0", 1)).await;
    let learner = handle.stop().await.unwrap();

    assert!(learner.trackback().is_empty());
    let state = TrainerState::from_bytes(&store.get(LATEST_STATE).await.unwrap().unwrap()).unwrap();
    assert_eq!(state.model_name, learner.state().model_name);
}

#[tokio::test(start_paused = true)]
async fn timed_checkpoint_needs_new_events() {
    use std::sync::Arc;

    use super::{test_context, test_event};
    use crate::storage::InMemStore;

    let store = Arc::new(InMemStore::new());
    let mut ctx = test_context(100);
    ctx.policy.interval = Some(Duration::from_secs(10));
    let learner = Learner::fresh_start(&ctx).unwrap();
    let mut worker = test_worker(store.clone(), false);
    worker.tick = ctx.policy.interval;
    let written = worker.checkpoints.written();
    let handle = LearnerHandle::spawn(learner, worker, 16);

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(*written.borrow(), None);

    handle.learn(test_event("e1", "0", 1)).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(written.borrow().is_some());

    let learner = handle.stop().await.unwrap();
    assert!(learner.trackback().is_empty());
}
