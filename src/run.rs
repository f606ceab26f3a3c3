//! Running a trainer.
//!
//! Architecture
//! ------------
//!
//! [`Trainer::run`] wires the components together:
//!
//! 1. Make sure the checkpoint container exists and recover the
//!    learner from the newest usable checkpoint.
//!
//! 2. Tell the event source where to resume.
//!
//! 3. Start the checkpoint writer, the evaluation pipeline, the stats
//!    reporter and the learner task, then the API server if a port is
//!    configured.
//!
//! 4. Feed events to the learner until the input ends or `shutdown`
//!    resolves.
//!
//! 5. Stop the learner, which takes the shutdown checkpoint and
//!    drains everything downstream, then stop the API server.

use std::future::Future;
use std::sync::Arc;

use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::sdk::metrics::MeterProvider;
use prometheus::Registry;
use tokio::sync::oneshot;

use crate::checkpoint::{CheckpointPolicy, CheckpointWriter, CheckpointWriterHandle};
use crate::config::TrainerConfig;
use crate::engine::{EngineArgs, EngineFactory, LinearEngineFactory};
use crate::errors::{InputError, Reraise, TrainerError};
use crate::inputs::{build_input, EventSource};
use crate::learner::worker::{LearnerHandle, LearnerWorker};
use crate::learner::{Learner, LearnerContext};
use crate::metrics::{initialize_metrics, TrainerMetrics};
use crate::outputs::{build_output, OutputSink};
use crate::pipeline::evaluation::EvaluationPipeline;
use crate::pipeline::rate_limited::RateLimitedPipeline;
use crate::pipeline::stats::StatsReporter;
use crate::recovery::RecoveryCoordinator;
use crate::storage::{build_store, ObjectStore};
use crate::webserver::{run_webserver, ApiState};

/// Events waiting for the learner task.
const LEARN_QUEUE_DEPTH: usize = 1024;

pub struct Trainer {
    config: TrainerConfig,
    store: Arc<dyn ObjectStore>,
    output: Arc<dyn OutputSink>,
    source: Box<dyn EventSource>,
    factory: Arc<dyn EngineFactory>,
    metrics: Arc<TrainerMetrics>,
    registry: Option<Registry>,
    // Keeps exporting into `registry` while alive.
    _provider: Option<MeterProvider>,
}

impl Trainer {
    /// Assemble a trainer from explicit parts.
    ///
    /// Metrics are recorded into `metrics` but not served.
    pub fn new(
        config: TrainerConfig,
        store: Arc<dyn ObjectStore>,
        output: Arc<dyn OutputSink>,
        source: Box<dyn EventSource>,
        metrics: Arc<TrainerMetrics>,
    ) -> Self {
        Self {
            config,
            store,
            output,
            source,
            factory: Arc::new(LinearEngineFactory),
            metrics,
            registry: None,
            _provider: None,
        }
    }

    /// Build everything `config` describes.
    pub fn from_config(config: TrainerConfig) -> Result<Self, TrainerError> {
        let (provider, registry) =
            initialize_metrics().reraise("error initializing metrics")?;
        let metrics = Arc::new(TrainerMetrics::new(&provider.meter("cbtrainer")));
        let store = build_store(&config.storage).reraise("error opening checkpoint storage")?;
        let output = build_output(&config.output).reraise("error opening evaluation output")?;
        let source =
            build_input(&config.input, metrics.clone()).reraise("error opening event input")?;

        let mut trainer = Self::new(config, store, output, source, metrics);
        trainer.registry = Some(registry);
        trainer._provider = Some(provider);
        Ok(trainer)
    }

    pub fn with_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Train until the input ends or `shutdown` resolves.
    ///
    /// Returns the learner after its final checkpoint was written.
    #[tracing::instrument(name = "Trainer.run", skip_all)]
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<Learner, TrainerError> {
        let Trainer {
            config,
            store,
            output,
            mut source,
            factory,
            metrics,
            registry,
            _provider,
        } = self;

        let ctx = LearnerContext {
            factory,
            args: EngineArgs::parse(&config.engine_args)?,
            policy: CheckpointPolicy::from_config(&config.checkpoint),
            metrics: metrics.clone(),
        };

        store
            .ensure_container()
            .await
            .reraise("error creating checkpoint container")?;
        let learner = RecoveryCoordinator::new(store.clone(), ctx).recover().await?;
        tracing::info!(
            "Starting {:?} with model {}",
            learner.phase(),
            learner.state().model_name.as_deref().unwrap_or("none")
        );
        source.seek(&learner.state().partition_offsets);

        let checkpoints = CheckpointWriterHandle::spawn(
            CheckpointWriter::new(store),
            config.checkpoint.queue_depth,
            config.checkpoint.write_timeout(),
            metrics.clone(),
        );
        let evaluation = config
            .evaluation
            .enabled
            .then(|| EvaluationPipeline::spawn(&config.evaluation, output, metrics.clone()));
        let summaries = evaluation.as_ref().map(EvaluationPipeline::summaries);
        let (reporter, status) = StatsReporter::new();
        let stats = RateLimitedPipeline::spawn("trainer stats", config.stats_window(), reporter);

        let worker = LearnerWorker {
            checkpoints,
            evaluation,
            evaluation_shutdown_timeout: config.evaluation.shutdown_timeout(),
            stats: Some(stats),
            tick: config.checkpoint.interval(),
            checkpoint_on_shutdown: config.checkpoint.on_shutdown,
        };
        let handle = LearnerHandle::spawn(learner, worker, LEARN_QUEUE_DEPTH);

        let mut api = None;
        if let (Some(port), Some(registry)) = (config.api_port, registry) {
            let (stop_api, stopped) = oneshot::channel::<()>();
            let state = ApiState {
                registry,
                status,
                evaluation: summaries,
            };
            let task = tokio::spawn(run_webserver(port, state, async {
                stopped.await.ok();
            }));
            api = Some((stop_api, task));
        }

        let fed = feed(source.as_mut(), &handle, shutdown).await;

        let learner = handle.stop().await.reraise("learner task failed")?;
        if let Some((stop_api, task)) = api {
            stop_api.send(()).ok();
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!("{err}"),
                Err(err) => tracing::error!("Trainer API server task failed: {err}"),
            }
        }
        tracing::info!(
            "Stopped after {} examples",
            learner.status().examples_learned
        );

        fed?;
        Ok(learner)
    }
}

/// Read events into the learner. Unparsable events were already
/// skipped by the source; any other input error stops the trainer.
async fn feed(
    source: &mut dyn EventSource,
    handle: &LearnerHandle,
    shutdown: impl Future<Output = ()>,
) -> Result<(), InputError> {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("Shutting down");
                return Ok(());
            }
            next = source.next() => match next {
                Ok(Some(event)) => {
                    if !handle.learn(event).await {
                        tracing::error!("Learner task is gone");
                        return Ok(());
                    }
                }
                Ok(None) => {
                    tracing::info!("Input ended");
                    return Ok(());
                }
                Err(err) => {
                    tracing::error!("Stopping on input error: {err}");
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
fn test_config() -> TrainerConfig {
    let mut config = TrainerConfig::default();
    config.engine_args = "--bits 10".to_owned();
    config.checkpoint.every_examples = 2;
    config.checkpoint.interval = 0;
    config.evaluation.window_ms = 10;
    config.evaluation.report_window_ms = 10;
    config.stats_window_ms = 10;
    config
}

#[tokio::test]
async fn runs_to_end_of_input() {
    use crate::checkpoint::{TrainerState, LATEST_STATE};
    use crate::event::Offset;
    use crate::inputs::ManualInput;
    use crate::learner::test_event;
    use crate::outputs::ManualOutput;
    use crate::storage::InMemStore;

    let store = Arc::new(InMemStore::new());
    let output = Arc::new(ManualOutput::new(1024 * 1024));
    let events = (1..=5).map(|i| test_event(&format!("e{i}"), "0", i));
    let trainer = Trainer::new(
        test_config(),
        store.clone(),
        output.clone(),
        Box::new(ManualInput::new(events)),
        Arc::new(TrainerMetrics::detached()),
    );
    let learner = trainer.run(std::future::pending()).await.unwrap();

    assert_eq!(learner.status().examples_learned, 5);
    // Two threshold checkpoints and one on shutdown.
    assert!(learner.trackback().is_empty());
    let state = TrainerState::from_bytes(&store.get(LATEST_STATE).await.unwrap().unwrap()).unwrap();
    assert_eq!(state.partition_offsets.values().next(), Some(&Offset(5)));
    assert!(!output.messages().is_empty());
}

#[tokio::test]
async fn resumes_after_restart() {
    use crate::inputs::ManualInput;
    use crate::learner::{test_event, LearnerPhase};
    use crate::outputs::NoOpOutput;
    use crate::storage::InMemStore;

    let store = Arc::new(InMemStore::new());
    let first = Trainer::new(
        test_config(),
        store.clone(),
        Arc::new(NoOpOutput),
        Box::new(ManualInput::new(
            (1..=3).map(|i| test_event(&format!("e{i}"), "0", i)),
        )),
        Arc::new(TrainerMetrics::detached()),
    );
    first.run(std::future::pending()).await.unwrap();

    // The input redelivers everything; only e4 is new.
    let second = Trainer::new(
        test_config(),
        store.clone(),
        Arc::new(NoOpOutput),
        Box::new(ManualInput::new(
            (1..=4).map(|i| test_event(&format!("e{i}"), "0", i)),
        )),
        Arc::new(TrainerMetrics::detached()),
    );
    let learner = second.run(std::future::pending()).await.unwrap();
    assert_eq!(learner.status().examples_learned, 1);
    assert_ne!(learner.phase(), LearnerPhase::FreshStarted);
}
