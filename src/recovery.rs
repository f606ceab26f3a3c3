//! Finding and loading the newest usable checkpoint on startup.
//!
//! Architecture
//! ------------
//!
//! [`RecoveryCoordinator::recover`] tries candidates in order; the
//! first one that gives a [`Learner`] wins:
//!
//! 1. The latest-state pointer [`LATEST_STATE`]. This is the only
//!    read needed in the common case.
//!
//! 2. The history, newest first: day directories, then the `state` of
//!    each time directory within a day.
//!
//! 3. A fresh start with an empty [`TrainerState`].
//!
//! Each candidate load ends in a [`LoadOutcome`]. A missing, corrupt
//! or unreadable candidate moves on to the next one, so a broken newer
//! checkpoint never hides an older good one. A model which was saved
//! with incompatible engine arguments ends the search: the engine is
//! started fresh but the saved partition offsets are kept.
//!
//! Only failing to initialize a fresh engine is an error.

use std::sync::Arc;

use crate::checkpoint::{CheckpointPath, TrainerState, LATEST_STATE};
use crate::errors::{EngineError, StorageError};
use crate::learner::{Learner, LearnerContext};
use crate::metrics::label;
use crate::storage::ObjectStore;

/// What happened trying to load one candidate checkpoint.
pub enum LoadOutcome {
    Loaded(Learner),
    /// Fresh engine with the candidate's partition offsets.
    IncompatibleArgs(Learner),
    NotFound,
    Unreachable(StorageError),
    Corrupt(String),
}

impl LoadOutcome {
    fn name(&self) -> &'static str {
        match self {
            LoadOutcome::Loaded(_) => "loaded",
            LoadOutcome::IncompatibleArgs(_) => "incompatible_args",
            LoadOutcome::NotFound => "not_found",
            LoadOutcome::Unreachable(_) => "unreachable",
            LoadOutcome::Corrupt(_) => "corrupt",
        }
    }
}

pub struct RecoveryCoordinator {
    store: Arc<dyn ObjectStore>,
    ctx: LearnerContext,
}

impl RecoveryCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, ctx: LearnerContext) -> Self {
        Self { store, ctx }
    }

    #[tracing::instrument(name = "RecoveryCoordinator.recover", skip_all)]
    pub async fn recover(&self) -> Result<Learner, EngineError> {
        if let Some(learner) = self.try_candidate(LATEST_STATE).await? {
            return Ok(learner);
        }

        for state_name in self.history().await {
            if let Some(learner) = self.try_candidate(&state_name).await? {
                return Ok(learner);
            }
        }

        tracing::info!("No usable checkpoint found");
        self.ctx
            .metrics
            .recoveries
            .add(1, &label("outcome", "fresh_start"));
        Learner::fresh_start(&self.ctx)
    }

    async fn try_candidate(&self, state_name: &str) -> Result<Option<Learner>, EngineError> {
        let outcome = self.load(state_name).await?;
        self.ctx
            .metrics
            .recoveries
            .add(1, &label("outcome", outcome.name()));
        match outcome {
            LoadOutcome::Loaded(learner) => {
                tracing::info!("Recovered from {state_name:?}");
                Ok(Some(learner))
            }
            LoadOutcome::IncompatibleArgs(learner) => Ok(Some(learner)),
            LoadOutcome::NotFound => {
                tracing::debug!("No checkpoint at {state_name:?}");
                Ok(None)
            }
            LoadOutcome::Unreachable(err) => {
                tracing::warn!("Unable to read checkpoint {state_name:?}: {err}");
                Ok(None)
            }
            LoadOutcome::Corrupt(msg) => {
                tracing::warn!("Skipping corrupt checkpoint {state_name:?}: {msg}");
                Ok(None)
            }
        }
    }

    /// Load the checkpoint whose state is stored at `state_name`.
    ///
    /// Only errors if even a fresh engine can't be initialized.
    pub async fn load(&self, state_name: &str) -> Result<LoadOutcome, EngineError> {
        let bytes = match self.store.get(state_name).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(LoadOutcome::NotFound),
            Err(err) => return Ok(LoadOutcome::Unreachable(err)),
        };
        let state = match TrainerState::from_bytes(&bytes) {
            Ok(state) => state,
            Err(err) => return Ok(LoadOutcome::Corrupt(format!("unparsable state: {err}"))),
        };
        let Some(model_name) = state.model_name.clone().filter(|name| !name.is_empty()) else {
            return Ok(LoadOutcome::Corrupt("state names no model".to_owned()));
        };
        let model = match self.store.get(&model_name).await {
            Ok(Some(model)) => model,
            Ok(None) => {
                return Ok(LoadOutcome::Corrupt(format!(
                    "model {model_name:?} is missing"
                )))
            }
            Err(err) => return Ok(LoadOutcome::Unreachable(err)),
        };

        match Learner::resume_from_latest(&self.ctx, state.clone(), &model) {
            Ok(learner) => Ok(LoadOutcome::Loaded(learner)),
            Err(err @ EngineError::IncompatibleArgs { .. }) => {
                tracing::warn!(
                    "Model {model_name:?} can't be resumed: {err}; \
                     starting a fresh model from the saved offsets"
                );
                let learner = Learner::fresh_start_from(&self.ctx, state.partition_offsets)?;
                Ok(LoadOutcome::IncompatibleArgs(learner))
            }
            Err(err) => Ok(LoadOutcome::Corrupt(err.to_string())),
        }
    }

    /// State object names of all checkpoints, newest first.
    ///
    /// Directories which can't be listed are skipped.
    async fn history(&self) -> Vec<String> {
        let days = match self.store.list_dirs("").await {
            Ok(days) => days,
            Err(err) => {
                tracing::warn!("Unable to list checkpoint history: {err}");
                return Vec::new();
            }
        };
        let mut days: Vec<_> = days
            .iter()
            .filter_map(|day| CheckpointPath::parse_day(day))
            .collect();
        days.sort_unstable_by(|a, b| b.cmp(a));

        let mut state_names = Vec::new();
        for day in days {
            let prefix = format!("{}/", day.format("%Y%m%d"));
            let names = match self.store.list(&prefix).await {
                Ok(names) => names,
                Err(err) => {
                    tracing::warn!("Unable to list checkpoints under {prefix:?}: {err}");
                    continue;
                }
            };
            let mut paths: Vec<_> = names
                .iter()
                .filter_map(|name| name.strip_suffix("/state"))
                .filter_map(CheckpointPath::parse)
                .collect();
            paths.sort_unstable_by(|a, b| b.cmp(a));
            state_names.extend(paths.iter().map(CheckpointPath::state));
        }
        state_names
    }
}

#[cfg(test)]
use crate::learner::{test_context, test_event, LearnerPhase};
#[cfg(test)]
use crate::storage::InMemStore;

/// Learn `events` and write a checkpoint of the learner.
#[cfg(test)]
async fn write_checkpoint(
    store: &Arc<InMemStore>,
    learner: &mut Learner,
    events: &[(&str, u64)],
) -> crate::checkpoint::CheckpointPayload {
    use crate::checkpoint::CheckpointWriter;

    for (id, offset) in events {
        learner.learn(&test_event(id, "0", *offset)).unwrap();
    }
    let payload = learner.create_checkpoint(true).unwrap();
    CheckpointWriter::new(store.clone())
        .write(&payload)
        .await
        .unwrap();
    payload
}

#[cfg(test)]
fn fresh_learner() -> Learner {
    Learner::fresh_start(&test_context(1)).unwrap()
}

#[cfg(test)]
fn coordinator(store: &Arc<InMemStore>) -> RecoveryCoordinator {
    RecoveryCoordinator::new(store.clone(), test_context(1))
}

#[cfg(test)]
fn offset_of(learner: &Learner, partition: &str) -> Option<u64> {
    use crate::event::PartitionKey;

    learner
        .state()
        .partition_offsets
        .get(&PartitionKey::from(partition))
        .map(|offset| offset.0)
}

#[tokio::test]
async fn recovery_uses_latest_pointer() {
    let store = Arc::new(InMemStore::new());
    let mut learner = fresh_learner();
    write_checkpoint(&store, &mut learner, &[("e1", 1)]).await;
    let payload = write_checkpoint(&store, &mut learner, &[("e2", 2)]).await;
    let lists_before = store.list_calls();

    let learner = coordinator(&store).recover().await.unwrap();
    assert_eq!(learner.phase(), LearnerPhase::Resumed);
    assert_eq!(learner.state().model_name, Some(payload.path.model()));
    assert_eq!(offset_of(&learner, "0"), Some(2));
    assert_eq!(store.list_calls(), lists_before);
}

#[tokio::test]
async fn recovery_falls_back_to_history() {
    let store = Arc::new(InMemStore::new());
    let mut learner = fresh_learner();
    let older = write_checkpoint(&store, &mut learner, &[("e1", 1)]).await;
    let newer = write_checkpoint(&store, &mut learner, &[("e2", 2)]).await;
    assert!(newer.path > older.path);

    // Corrupt the latest pointer and the newest checkpoint's model.
    store.put(LATEST_STATE, b"{not json").await.unwrap();
    store.put(&newer.path.model(), b"garbage").await.unwrap();

    let learner = coordinator(&store).recover().await.unwrap();
    assert_eq!(learner.phase(), LearnerPhase::Resumed);
    assert_eq!(learner.state().model_name, Some(older.path.model()));
    assert_eq!(offset_of(&learner, "0"), Some(1));
}

#[tokio::test]
async fn recovery_skips_state_without_model_name() {
    let store = Arc::new(InMemStore::new());
    let older = write_checkpoint(&store, &mut fresh_learner(), &[("e1", 1)]).await;
    store
        .put(LATEST_STATE, br#"{"partition_offsets":{"0":9},"model_name":""}"#)
        .await
        .unwrap();

    let learner = coordinator(&store).recover().await.unwrap();
    assert_eq!(learner.state().model_name, Some(older.path.model()));
}

#[tokio::test]
async fn recovery_exhausted_is_fresh_start() {
    let store = Arc::new(InMemStore::new());
    store.ensure_container().await.unwrap();
    store.put(LATEST_STATE, b"junk").await.unwrap();
    store.put("20240101/000000/state", b"junk").await.unwrap();
    store.put("notaday/000000/state", b"junk").await.unwrap();

    let learner = coordinator(&store).recover().await.unwrap();
    assert_eq!(learner.phase(), LearnerPhase::FreshStarted);
    assert_eq!(learner.state(), &TrainerState::default());
}

#[tokio::test]
async fn empty_store_is_fresh_start() {
    let store = Arc::new(InMemStore::new());
    let learner = coordinator(&store).recover().await.unwrap();
    assert_eq!(learner.phase(), LearnerPhase::FreshStarted);
    assert!(learner.state().partition_offsets.is_empty());
}

#[tokio::test]
async fn incompatible_args_keep_offsets() {
    use crate::engine::EngineArgs;

    let store = Arc::new(InMemStore::new());
    write_checkpoint(&store, &mut fresh_learner(), &[("e1", 5)]).await;

    let mut ctx = test_context(1);
    ctx.args = EngineArgs::parse("--bits 12").unwrap();
    let learner = RecoveryCoordinator::new(store.clone(), ctx)
        .recover()
        .await
        .unwrap();
    assert_eq!(learner.phase(), LearnerPhase::FreshStarted);
    assert_eq!(offset_of(&learner, "0"), Some(5));
    assert_eq!(learner.state().model_name, None);
}

#[tokio::test]
async fn history_is_newest_first() {
    let store = Arc::new(InMemStore::new());
    store.ensure_container().await.unwrap();
    for name in [
        "20240101/235959/state",
        "20240102/000001/state",
        "20240102/000001-1/state",
        "20240102/000001-1/model",
        "20231231/120000/state",
        "current/model",
        "state",
    ] {
        store.put(name, b"").await.unwrap();
    }

    let history = coordinator(&store).history().await;
    assert_eq!(
        history,
        vec![
            "20240102/000001-1/state",
            "20240102/000001/state",
            "20240101/235959/state",
            "20231231/120000/state",
        ]
    );
}

#[tokio::test]
async fn corrupt_latest_pointer_loads_newest_history() {
    let store = Arc::new(InMemStore::new());
    let mut learner = fresh_learner();
    let older = write_checkpoint(&store, &mut learner, &[("e1", 1)]).await;
    let newer = write_checkpoint(&store, &mut learner, &[("e2", 2)]).await;
    assert!(newer.path > older.path);

    store.put(LATEST_STATE, b"{not json").await.unwrap();

    let learner = coordinator(&store).recover().await.unwrap();
    assert_eq!(learner.phase(), LearnerPhase::Resumed);
    assert_eq!(learner.state().model_name, Some(newer.path.model()));
    assert_eq!(offset_of(&learner, "0"), Some(2));
}

#[tokio::test]
async fn overflowing_cost_keeps_checkpoint_loadable() {
    let store = Arc::new(InMemStore::new());
    let mut learner = fresh_learner();
    learner.learn(&test_event("e1", "0", 1)).unwrap();

    // 1e39 overflows f32 to infinity when parsed.
    let mut json = serde_json::to_value(test_event("e2", "0", 2)).unwrap();
    json["label"]["cost"] = serde_json::from_str("1e39").unwrap();
    let overflowing: crate::event::DecisionEvent = serde_json::from_value(json).unwrap();
    assert!(learner.learn(&overflowing).is_none());

    let payload = write_checkpoint(&store, &mut learner, &[("e3", 3)]).await;

    let recovered = coordinator(&store).recover().await.unwrap();
    assert_eq!(recovered.phase(), LearnerPhase::Resumed);
    assert_eq!(recovered.state().model_name, Some(payload.path.model()));
    assert_eq!(offset_of(&recovered, "0"), Some(3));
}
