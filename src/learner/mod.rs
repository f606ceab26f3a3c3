//! Per-event learning and checkpoint creation.
//!
//! Architecture
//! ------------
//!
//! A [`Learner`] owns the engine, the in-memory [`TrainerState`] and
//! the trackback of event IDs learned since the last checkpoint. It is
//! only ever driven by one task (see [`worker`]), so none of its
//! fields need locking, and a checkpoint snapshot can't interleave
//! with a `learn`.
//!
//! A Learner only exists once its engine is initialized: it is built
//! with either [`Learner::fresh_start`] or
//! [`Learner::resume_from_latest`], the latter usually through
//! [`crate::recovery::RecoveryCoordinator`].
//!
//! [`Learner::learn`] never fails: errors are logged, counted and
//! turned into `None`. The example handed to the engine is always
//! given back to it via [`Engine::finish_example`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::{CheckpointPath, CheckpointPayload, CheckpointPolicy, Trackback, TrainerState};
use crate::engine::marshal::to_engine_example;
use crate::engine::{Engine, EngineArgs, EngineFactory, Example, Prediction};
use crate::errors::EngineError;
use crate::event::{DecisionEvent, Label, Offset, PartitionKey};
use crate::metrics::{label, TrainerMetrics};
use crate::pipeline::stats::TrainerStatus;
use crate::with_timer;

pub mod worker;

pub use worker::{LearnerHandle, LearnerWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearnerPhase {
    /// Engine initialized without a saved model.
    FreshStarted,
    /// Engine initialized from a checkpoint.
    Resumed,
    /// At least one event learned.
    Learning,
}

/// What every [`Learner`] is built with.
#[derive(Clone)]
pub struct LearnerContext {
    pub factory: Arc<dyn EngineFactory>,
    pub args: EngineArgs,
    pub policy: CheckpointPolicy,
    pub metrics: Arc<TrainerMetrics>,
}

/// Result of learning one event.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnResult {
    pub label: Label,
    /// Number of actions that were available.
    pub actions: u32,
    /// What the engine would have done before learning this event.
    pub prediction: Prediction,
    pub partition: PartitionKey,
    pub timestamp: DateTime<Utc>,
    /// From the event's timestamp until it was learned.
    pub latency: Duration,
}

/// Why an event couldn't be learned.
struct LearnFailure {
    reason: &'static str,
    error: Box<dyn std::error::Error>,
}

impl LearnFailure {
    fn new(reason: &'static str, error: impl Into<Box<dyn std::error::Error>>) -> Self {
        Self {
            reason,
            error: error.into(),
        }
    }
}

/// Gives the example back to the engine however learning exits.
struct ExampleGuard<'a> {
    engine: &'a mut dyn Engine,
    example: Example,
}

impl<'a> ExampleGuard<'a> {
    fn learn(&mut self) -> Result<Prediction, EngineError> {
        self.engine.learn(&mut self.example)
    }
}

impl<'a> Drop for ExampleGuard<'a> {
    fn drop(&mut self) {
        self.engine.finish_example(std::mem::take(&mut self.example));
    }
}

pub struct Learner {
    engine: Box<dyn Engine>,
    state: TrainerState,
    trackback: Vec<String>,
    phase: LearnerPhase,
    policy: CheckpointPolicy,
    metrics: Arc<TrainerMetrics>,
    examples_learned: u64,
    learn_failures: u64,
    since_checkpoint: u64,
    checkpoints_created: u64,
    last_path: Option<CheckpointPath>,
    model_id: Option<String>,
}

impl Learner {
    fn new(
        ctx: &LearnerContext,
        engine: Box<dyn Engine>,
        state: TrainerState,
        phase: LearnerPhase,
    ) -> Self {
        let last_path = state
            .model_name
            .as_deref()
            .and_then(|name| name.strip_suffix("/model"))
            .and_then(CheckpointPath::parse);
        Self {
            engine,
            state,
            trackback: Vec::new(),
            phase,
            policy: ctx.policy.clone(),
            metrics: ctx.metrics.clone(),
            examples_learned: 0,
            learn_failures: 0,
            since_checkpoint: 0,
            checkpoints_created: 0,
            last_path,
            model_id: None,
        }
    }

    /// New engine, empty state.
    pub fn fresh_start(ctx: &LearnerContext) -> Result<Self, EngineError> {
        let engine = ctx.factory.initialize(&ctx.args, None)?;
        tracing::info!("Fresh start with engine arguments `{}`", engine.args());
        Ok(Self::new(
            ctx,
            engine,
            TrainerState::default(),
            LearnerPhase::FreshStarted,
        ))
    }

    /// New engine, but keep where each partition got to.
    ///
    /// Used when a saved model can't be loaded under the configured
    /// arguments.
    pub fn fresh_start_from(
        ctx: &LearnerContext,
        partition_offsets: BTreeMap<PartitionKey, Offset>,
    ) -> Result<Self, EngineError> {
        let mut learner = Self::fresh_start(ctx)?;
        learner.state.partition_offsets = partition_offsets;
        Ok(learner)
    }

    /// Engine initialized from `model` with save-resume, continuing
    /// from `state`.
    pub fn resume_from_latest(
        ctx: &LearnerContext,
        state: TrainerState,
        model: &[u8],
    ) -> Result<Self, EngineError> {
        let engine = ctx
            .factory
            .initialize(&ctx.args.with_save_resume(), Some(model))?;
        tracing::info!(
            "Resumed model {:?} with engine arguments `{}`",
            state.model_name,
            engine.args()
        );
        Ok(Self::new(ctx, engine, state, LearnerPhase::Resumed))
    }

    pub fn phase(&self) -> LearnerPhase {
        self.phase
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Event IDs learned since the last checkpoint.
    pub fn trackback(&self) -> &[String] {
        &self.trackback
    }

    pub fn examples_since_checkpoint(&self) -> u64 {
        self.since_checkpoint
    }

    pub fn should_checkpoint(&self) -> bool {
        self.policy.should_checkpoint(self.since_checkpoint)
    }

    pub fn should_checkpoint_on_tick(&self) -> bool {
        self.policy.should_checkpoint_on_tick(self.since_checkpoint)
    }

    /// Learn from one event.
    ///
    /// Returns `None` if the event couldn't be learned.
    pub fn learn(&mut self, event: &DecisionEvent) -> Option<LearnResult> {
        let res = with_timer!(self.metrics.learn_duration, [], self.try_learn(event));
        match res {
            Ok(result) => Some(result),
            Err(failure) => {
                tracing::warn!(
                    "Unable to learn event {:?} at {}@{}: {}",
                    event.event_id,
                    event.partition,
                    event.offset.0,
                    failure.error
                );
                self.learn_failures += 1;
                self.metrics
                    .learn_failures
                    .add(1, &label("reason", failure.reason));
                None
            }
        }
    }

    fn try_learn(&mut self, event: &DecisionEvent) -> Result<LearnResult, LearnFailure> {
        let features = self.engine.acquire_features();
        let example =
            to_engine_example(event, features).map_err(|err| LearnFailure::new("marshal", err))?;
        let feature_count = example.feature_count();

        let mut guard = ExampleGuard {
            engine: self.engine.as_mut(),
            example,
        };
        let prediction = guard
            .learn()
            .map_err(|err| LearnFailure::new("engine", err))?;
        drop(guard);

        self.trackback.push(event.event_id.clone());
        self.state
            .partition_offsets
            .insert(event.partition.clone(), event.offset);
        self.since_checkpoint += 1;
        self.examples_learned += 1;
        self.phase = LearnerPhase::Learning;

        let latency = (Utc::now() - event.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.metrics.examples_learned.add(1, &[]);
        self.metrics
            .features_per_example
            .record(feature_count as u64, &[]);
        self.metrics.event_latency.record(latency.as_secs_f64(), &[]);

        Ok(LearnResult {
            label: event.label,
            actions: event.actions,
            prediction,
            partition: event.partition.clone(),
            timestamp: event.timestamp,
            latency,
        })
    }

    /// Snapshot everything needed for a checkpoint and start a new
    /// trackback.
    ///
    /// If this fails, nothing changed and the pending trackback is
    /// kept for the next checkpoint.
    pub fn create_checkpoint(
        &mut self,
        update_latest_model: bool,
    ) -> Result<CheckpointPayload, EngineError> {
        let start = Instant::now();
        let path = CheckpointPath::new(Utc::now(), self.last_path.as_ref());
        let model_id = Uuid::new_v4().to_string();
        let model = self.engine.serialize_weights()?;

        let model_name = path.model();
        let state = TrainerState {
            partition_offsets: self.state.partition_offsets.clone(),
            model_name: Some(model_name.clone()),
        }
        .to_bytes()?;

        // Nothing can fail from here on.
        self.state.model_name = Some(model_name);
        let trackback = Trackback {
            model_id: model_id.clone(),
            event_ids: std::mem::take(&mut self.trackback),
        };
        let trackback_count = trackback.event_ids.len();
        self.since_checkpoint = 0;
        self.checkpoints_created += 1;
        self.last_path = Some(path);
        self.model_id = Some(model_id.clone());
        self.metrics.checkpoints_created.add(1, &[]);

        tracing::debug!(
            "Created checkpoint {path} with {trackback_count} trackback events in {:?}",
            start.elapsed()
        );
        Ok(CheckpointPayload {
            path,
            model_id,
            state,
            model,
            trackback: trackback.to_bytes(),
            trackback_count,
            update_latest_model,
        })
    }

    /// Create the next checkpoint with model publishing according to
    /// the policy.
    ///
    /// Failures are logged and counted.
    pub fn checkpoint(&mut self) -> Option<CheckpointPayload> {
        let publish = self.policy.publish_model(self.checkpoints_created + 1);
        match self.create_checkpoint(publish) {
            Ok(payload) => Some(payload),
            Err(err) => {
                tracing::error!("Unable to create checkpoint: {err}");
                self.metrics
                    .checkpoints_failed
                    .add(1, &label("reason", "snapshot"));
                None
            }
        }
    }

    pub fn status(&self) -> TrainerStatus {
        TrainerStatus {
            phase: self.phase,
            examples_learned: self.examples_learned,
            learn_failures: self.learn_failures,
            pending_trackback: self.trackback.len(),
            checkpoints_created: self.checkpoints_created,
            last_checkpoint: None,
            model_id: self.model_id.clone(),
            model_name: self.state.model_name.clone(),
            partition_offsets: self.state.partition_offsets.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_context(every_examples: u64) -> LearnerContext {
    use crate::engine::LinearEngineFactory;

    LearnerContext {
        factory: Arc::new(LinearEngineFactory),
        args: EngineArgs::parse("--bits 10").unwrap(),
        policy: CheckpointPolicy::every(every_examples),
        metrics: Arc::new(TrainerMetrics::detached()),
    }
}

#[cfg(test)]
pub(crate) fn test_event(id: &str, partition: &str, offset: u64) -> DecisionEvent {
    DecisionEvent {
        event_id: id.to_owned(),
        partition: partition.into(),
        offset: Offset(offset),
        timestamp: Utc::now() - chrono::Duration::seconds(2),
        actions: 3,
        context: serde_json::json!({"user": {"country": "NL"}}),
        label: Label {
            action: 2,
            probability: 0.5,
            cost: -1.0,
        },
    }
}

#[test]
fn learn_works() {
    let mut learner = Learner::fresh_start(&test_context(10)).unwrap();
    assert_eq!(learner.phase(), LearnerPhase::FreshStarted);

    let result = learner.learn(&test_event("e1", "0", 7)).unwrap();
    assert_eq!(learner.phase(), LearnerPhase::Learning);
    assert_eq!(result.partition, PartitionKey::from("0"));
    assert_eq!(result.actions, 3);
    assert_eq!(result.prediction.0.len(), 3);
    assert!(result.latency >= Duration::from_secs(2));
    assert_eq!(learner.state().partition_offsets[&PartitionKey::from("0")], Offset(7));
    assert_eq!(learner.trackback(), ["e1".to_owned()]);
}

#[test]
fn future_timestamp_latency_is_zero() {
    let mut learner = Learner::fresh_start(&test_context(10)).unwrap();
    let mut event = test_event("e1", "0", 1);
    event.timestamp = Utc::now() + chrono::Duration::hours(1);
    let result = learner.learn(&event).unwrap();
    assert_eq!(result.latency, Duration::ZERO);
}

#[test]
fn bad_event_is_sentinel() {
    let mut learner = Learner::fresh_start(&test_context(10)).unwrap();
    let mut event = test_event("e1", "0", 1);
    event.label.action = 9;
    assert_eq!(learner.learn(&event), None);
    assert!(learner.trackback().is_empty());
    assert!(learner.state().partition_offsets.is_empty());
    assert_eq!(learner.examples_since_checkpoint(), 0);
    assert_eq!(learner.status().learn_failures, 1);
    assert_eq!(learner.phase(), LearnerPhase::FreshStarted);
}

#[test]
fn trackback_is_conserved() {
    let mut learner = Learner::fresh_start(&test_context(3)).unwrap();
    let ids: Vec<_> = (0..5).map(|i| format!("e{i}")).collect();
    for (i, id) in ids.iter().enumerate() {
        learner.learn(&test_event(id, "0", i as u64)).unwrap();
    }
    assert!(learner.should_checkpoint());

    let payload = learner.create_checkpoint(true).unwrap();
    assert_eq!(payload.trackback_count, 5);
    let trackback = Trackback::parse(&payload.trackback).unwrap();
    assert_eq!(trackback.event_ids, ids);
    assert_eq!(trackback.model_id, payload.model_id);
    assert!(learner.trackback().is_empty());
    assert!(!learner.should_checkpoint());

    learner.learn(&test_event("e5", "0", 5)).unwrap();
    let payload = learner.create_checkpoint(false).unwrap();
    assert_eq!(
        Trackback::parse(&payload.trackback).unwrap().event_ids,
        vec!["e5".to_owned()]
    );
}

#[test]
fn line_break_in_event_id_is_sentinel() {
    let mut learner = Learner::fresh_start(&test_context(3)).unwrap();
    for id in ["a\nb", "c\r", "\r\n"] {
        assert_eq!(learner.learn(&test_event(id, "0", 1)), None);
    }
    assert!(learner.trackback().is_empty());
    assert_eq!(learner.status().learn_failures, 3);

    learner.learn(&test_event("e2", "0", 2)).unwrap();
    let payload = learner.create_checkpoint(true).unwrap();
    let trackback = Trackback::parse(&payload.trackback).unwrap();
    assert_eq!(trackback.event_ids, vec!["e2".to_owned()]);
    assert_eq!(payload.trackback_count, trackback.event_ids.len());
}

#[test]
fn checkpoint_state_names_model() {
    let mut learner = Learner::fresh_start(&test_context(1)).unwrap();
    learner.learn(&test_event("e1", "a", 1)).unwrap();
    learner.learn(&test_event("e2", "b", 4)).unwrap();
    let payload = learner.create_checkpoint(true).unwrap();

    let state = TrainerState::from_bytes(&payload.state).unwrap();
    assert_eq!(state.model_name, Some(payload.path.model()));
    assert_eq!(state.partition_offsets[&PartitionKey::from("a")], Offset(1));
    assert_eq!(state.partition_offsets[&PartitionKey::from("b")], Offset(4));
    assert_eq!(learner.state(), &state);

    // Same second, so the next checkpoint gets its own directory.
    let next = learner.create_checkpoint(true).unwrap();
    assert!(next.path > payload.path);
}

#[test]
fn resume_continues_from_state() {
    let ctx = test_context(1);
    let mut learner = Learner::fresh_start(&ctx).unwrap();
    learner.learn(&test_event("e1", "0", 3)).unwrap();
    let payload = learner.create_checkpoint(true).unwrap();

    let state = TrainerState::from_bytes(&payload.state).unwrap();
    let resumed = Learner::resume_from_latest(&ctx, state.clone(), &payload.model).unwrap();
    assert_eq!(resumed.phase(), LearnerPhase::Resumed);
    assert_eq!(resumed.state(), &state);
    assert!(resumed.trackback().is_empty());
}

#[test]
fn publish_follows_policy() {
    let mut ctx = test_context(1);
    ctx.policy.publish_model_every = 2;
    let mut learner = Learner::fresh_start(&ctx).unwrap();
    let mut published = Vec::new();
    for i in 0..4 {
        learner.learn(&test_event(&format!("e{i}"), "0", i)).unwrap();
        published.push(learner.checkpoint().unwrap().update_latest_model);
    }
    assert_eq!(published, vec![false, true, false, true]);
}
