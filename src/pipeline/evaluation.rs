//! Counterfactual evaluation of alternative policies.
//!
//! Architecture
//! ------------
//!
//! Every [`LearnResult`] is expanded into one
//! [`PolicyEvaluationRecord`] per policy:
//!
//! - [`LATEST_POLICY`] takes the action the engine predicted before
//!   learning the event.
//!
//! - [`DEPLOYED_POLICY`] takes the logged action.
//!
//! - `Constant Policy i` always takes action `i`, for every available
//!   action.
//!
//! The cost estimate is the inverse propensity score: the logged cost
//! divided by the logged probability when the policy's action matches
//! the logged action, otherwise `0`.
//!
//! ```text
//!            bounded          Semaphore-limited         one task and
//!            queue            expansion tasks           queue per policy
//! push() ──▶ [....] ──▶ expand ─┬─▶ route ──▶ [..] ──▶ window ──▶ sink.send(policy, batch)
//!                               └─▶ route ──▶ [..] ──▶ window ──▶ ...
//! ```
//!
//! A policy's window opens with its first record and closes after
//! the configured time, or earlier once the batch reaches the size
//! cap. Each closed window is sent as one message, one record per
//! line, partitioned by policy name. A failed send is logged and
//! counted; the pipeline keeps going.
//!
//! [`EvaluationPipeline::push`] waits when the input queue is full,
//! slowing the learner down instead of buffering without bound.
//!
//! The running mean estimate of each policy is logged through a
//! [`RateLimitedPipeline`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use super::rate_limited::{Process, RateLimitedPipeline};
use crate::config::EvaluationConfig;
use crate::learner::LearnResult;
use crate::metrics::TrainerMetrics;
use crate::outputs::OutputSink;

pub const LATEST_POLICY: &str = "Latest Policy";
pub const DEPLOYED_POLICY: &str = "Deployed Policy";

pub fn constant_policy(action: u32) -> String {
    format!("Constant Policy {action}")
}

/// Records waiting per policy before expansion waits on the window
/// task.
const GROUP_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEvaluationRecord {
    pub policy_name: String,
    pub cost_estimate: f32,
    /// Of the decision event.
    pub timestamp: DateTime<Utc>,
}

/// One record per policy for a learn result.
pub fn expand(result: &LearnResult) -> Vec<PolicyEvaluationRecord> {
    let label = result.label;
    let estimate = |action: u32| {
        if action == label.action {
            label.cost / label.probability
        } else {
            0.0
        }
    };
    let record = |policy_name: String, action: u32| PolicyEvaluationRecord {
        policy_name,
        cost_estimate: estimate(action),
        timestamp: result.timestamp,
    };

    let mut records = Vec::with_capacity(result.actions as usize + 2);
    if let Some(action) = result.prediction.chosen_action() {
        records.push(record(LATEST_POLICY.to_owned(), action));
    }
    records.push(record(DEPLOYED_POLICY.to_owned(), label.action));
    records.extend((1..=result.actions).map(|action| record(constant_policy(action), action)));
    records
}

/// Running mean cost estimate of a policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySummary {
    pub records: u64,
    pub mean_cost: f64,
}

impl PolicySummary {
    fn add(&mut self, estimate: f32) {
        self.records += 1;
        self.mean_cost += (f64::from(estimate) - self.mean_cost) / self.records as f64;
    }
}

type Summaries = BTreeMap<String, PolicySummary>;

struct SummaryReporter {
    published: watch::Sender<Summaries>,
}

#[async_trait]
impl Process<Summaries> for SummaryReporter {
    async fn process(
        &mut self,
        summaries: Summaries,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        for (policy, summary) in &summaries {
            tracing::info!(
                "{policy}: mean cost estimate {:.4} over {} records",
                summary.mean_cost,
                summary.records
            );
        }
        self.published.send_replace(summaries);
        Ok(())
    }
}

struct WindowSettings {
    window: Duration,
    max_batch_bytes: usize,
}

/// Sends records to the window task of their policy, starting one if
/// needed.
struct Router {
    /// `None` once closed.
    groups: Mutex<Option<HashMap<String, mpsc::Sender<PolicyEvaluationRecord>>>>,
    tasks: Mutex<JoinSet<()>>,
    settings: Arc<WindowSettings>,
    sink: Arc<dyn OutputSink>,
    metrics: Arc<TrainerMetrics>,
}

impl Router {
    async fn route(&self, record: PolicyEvaluationRecord) {
        let tx = {
            let Ok(mut groups) = self.groups.lock() else {
                return;
            };
            let Some(groups) = groups.as_mut() else {
                tracing::debug!("Dropping record for {} after close", record.policy_name);
                return;
            };
            match groups.get(&record.policy_name) {
                Some(tx) => tx.clone(),
                None => {
                    let (tx, rx) = mpsc::channel(GROUP_QUEUE_DEPTH);
                    let window = run_window(
                        record.policy_name.clone(),
                        rx,
                        self.settings.clone(),
                        self.sink.clone(),
                        self.metrics.clone(),
                    );
                    if let Ok(mut tasks) = self.tasks.lock() {
                        tasks.spawn(window);
                    }
                    groups.insert(record.policy_name.clone(), tx.clone());
                    tx
                }
            }
        };
        if let Err(err) = tx.send(record).await {
            tracing::debug!("Window for {} is gone", err.0.policy_name);
        }
    }

    /// Stop accepting records and wait for every window to flush.
    ///
    /// Dropping the returned future aborts the windows.
    async fn close(&self) {
        if let Ok(mut groups) = self.groups.lock() {
            groups.take();
        }
        let mut tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                tracing::error!("Evaluation window task failed: {err}");
            }
        }
    }
}

enum Next {
    Record(PolicyEvaluationRecord),
    WindowClosed,
    InputClosed,
}

/// Batch one policy's records by time and size.
async fn run_window(
    policy: String,
    mut rx: mpsc::Receiver<PolicyEvaluationRecord>,
    settings: Arc<WindowSettings>,
    sink: Arc<dyn OutputSink>,
    metrics: Arc<TrainerMetrics>,
) {
    let max_bytes = settings.max_batch_bytes.min(sink.max_message_size());
    let mut batch: Vec<u8> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let next = match deadline {
            None => rx.recv().await.map_or(Next::InputClosed, Next::Record),
            Some(at) => tokio::select! {
                received = rx.recv() => received.map_or(Next::InputClosed, Next::Record),
                _ = tokio::time::sleep_until(at) => Next::WindowClosed,
            },
        };

        match next {
            Next::Record(record) => {
                let mut line = match serde_json::to_vec(&record) {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::error!("Unable to encode evaluation record: {err}");
                        continue;
                    }
                };
                line.push(b'\n');

                if !batch.is_empty() && batch.len() + line.len() > max_bytes {
                    flush(&policy, &mut batch, sink.as_ref(), &metrics).await;
                    deadline = None;
                }
                if batch.is_empty() {
                    deadline = Some(Instant::now() + settings.window);
                }
                batch.extend_from_slice(&line);
                if batch.len() >= max_bytes {
                    flush(&policy, &mut batch, sink.as_ref(), &metrics).await;
                    deadline = None;
                }
            }
            Next::WindowClosed => {
                flush(&policy, &mut batch, sink.as_ref(), &metrics).await;
                deadline = None;
            }
            Next::InputClosed => break,
        }
    }

    flush(&policy, &mut batch, sink.as_ref(), &metrics).await;
    tracing::trace!("Window for {policy} stopped");
}

async fn flush(policy: &str, batch: &mut Vec<u8>, sink: &dyn OutputSink, metrics: &TrainerMetrics) {
    if batch.is_empty() {
        return;
    }
    let message = std::mem::take(batch);
    let size = message.len() as u64;
    match sink.send(policy, message).await {
        Ok(()) => {
            metrics.evaluation_batches_sent.add(1, &[]);
            metrics.evaluation_batch_bytes.record(size, &[]);
        }
        Err(err) => {
            tracing::error!("Unable to send evaluation batch for {policy}: {err}");
            metrics.evaluation_batches_failed.add(1, &[]);
        }
    }
}

async fn run_expansion(
    mut rx: mpsc::Receiver<LearnResult>,
    router: Arc<Router>,
    parallelism: usize,
    reporter: RateLimitedPipeline<Summaries>,
    metrics: Arc<TrainerMetrics>,
) {
    let permits = Arc::new(Semaphore::new(parallelism));
    let mut summaries = Summaries::new();

    while let Some(result) = rx.recv().await {
        let records = expand(&result);
        for record in &records {
            summaries
                .entry(record.policy_name.clone())
                .or_default()
                .add(record.cost_estimate);
        }
        metrics.evaluation_records.add(records.len() as u64, &[]);
        reporter.push(summaries.clone());

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let router = router.clone();
        tokio::spawn(async move {
            for record in records {
                router.route(record).await;
            }
            drop(permit);
        });
    }

    // Wait for all in-flight expansions.
    let all = u32::try_from(parallelism).unwrap_or(u32::MAX);
    if permits.acquire_many(all).await.is_err() {
        tracing::warn!("Evaluation expansion permits closed early");
    }
    reporter.close().await;
}

pub struct EvaluationPipeline {
    input: mpsc::Sender<LearnResult>,
    expansion: JoinHandle<()>,
    router: Arc<Router>,
    summaries: watch::Receiver<Summaries>,
}

impl EvaluationPipeline {
    pub fn spawn(
        config: &EvaluationConfig,
        sink: Arc<dyn OutputSink>,
        metrics: Arc<TrainerMetrics>,
    ) -> Self {
        let (input, rx) = mpsc::channel(config.queue_depth.max(1));
        let router = Arc::new(Router {
            groups: Mutex::new(Some(HashMap::new())),
            tasks: Mutex::new(JoinSet::new()),
            settings: Arc::new(WindowSettings {
                window: config.window(),
                max_batch_bytes: config.max_batch_bytes.max(1),
            }),
            sink,
            metrics: metrics.clone(),
        });
        let (published, summaries) = watch::channel(Summaries::new());
        let reporter = RateLimitedPipeline::spawn(
            "evaluation summary",
            config.report_window(),
            SummaryReporter { published },
        );
        let expansion = tokio::spawn(run_expansion(
            rx,
            router.clone(),
            config.parallelism.max(1),
            reporter,
            metrics,
        ));
        Self {
            input,
            expansion,
            router,
            summaries,
        }
    }

    /// Queue a learn result for evaluation.
    ///
    /// Waits while the input queue is full.
    pub async fn push(&self, result: LearnResult) {
        if self.input.send(result).await.is_err() {
            tracing::error!("Evaluation pipeline is gone; dropping learn result");
        }
    }

    /// Latest reported running mean estimate per policy.
    pub fn summaries(&self) -> watch::Receiver<BTreeMap<String, PolicySummary>> {
        self.summaries.clone()
    }

    /// Stop taking input, then send every pending batch.
    ///
    /// Whatever isn't sent within `timeout` is dropped.
    pub async fn stop(mut self, timeout: Duration) {
        drop(self.input);
        let router = self.router.clone();
        let expansion = &mut self.expansion;
        let drained = tokio::time::timeout(timeout, async move {
            if let Err(err) = expansion.await {
                tracing::error!("Evaluation expansion task failed: {err}");
            }
            router.close().await;
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                "Evaluation pipeline did not drain within {timeout:?}; dropping unsent batches"
            );
            self.expansion.abort();
        }
    }
}

#[cfg(test)]
fn result(actions: u32, logged: u32, predicted: u32) -> LearnResult {
    use crate::engine::{ActionProbability, Prediction};
    use crate::event::Label;

    LearnResult {
        label: Label {
            action: logged,
            probability: 0.25,
            cost: -1.0,
        },
        actions,
        prediction: Prediction(vec![ActionProbability {
            action: predicted,
            probability: 1.0,
        }]),
        partition: "0".into(),
        timestamp: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
        latency: Duration::ZERO,
    }
}

#[cfg(test)]
fn lines_per_policy(messages: &[(String, Vec<u8>)]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for (policy, message) in messages {
        *counts.entry(policy.clone()).or_default() += message.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count();
    }
    counts
}

#[test]
fn fan_out_works() {
    let records = expand(&result(3, 2, 1));
    let found: Vec<_> = records
        .iter()
        .map(|r| (r.policy_name.as_str(), r.cost_estimate))
        .collect();
    assert_eq!(
        found,
        vec![
            ("Latest Policy", 0.0),
            ("Deployed Policy", -4.0),
            ("Constant Policy 1", 0.0),
            ("Constant Policy 2", -4.0),
            ("Constant Policy 3", 0.0),
        ]
    );

    let records = expand(&result(3, 2, 2));
    assert_eq!(records[0].cost_estimate, -4.0);
}

#[test]
fn record_encoding_works() {
    let record = &expand(&result(1, 1, 1))[1];
    assert_eq!(
        serde_json::to_string(record).unwrap(),
        r#"{"policyName":"Deployed Policy","costEstimate":-4.0,"timestamp":"2024-01-01T00:00:00Z"}"#
    );
}

#[test]
fn running_mean_works() {
    let mut summary = PolicySummary::default();
    for estimate in [1.0, 2.0, 6.0] {
        summary.add(estimate);
    }
    assert_eq!(summary.records, 3);
    assert!((summary.mean_cost - 3.0).abs() < 1e-9);
}

#[cfg(test)]
fn test_config() -> EvaluationConfig {
    EvaluationConfig {
        window_ms: 5_000,
        ..EvaluationConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn one_batch_per_window() {
    use crate::outputs::ManualOutput;

    let output = Arc::new(ManualOutput::new(1024 * 1024));
    let pipeline = EvaluationPipeline::spawn(
        &test_config(),
        output.clone(),
        Arc::new(TrainerMetrics::detached()),
    );
    for _ in 0..50 {
        pipeline.push(result(3, 2, 1)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let messages = output.messages();
    assert_eq!(messages.len(), 5);
    assert!(lines_per_policy(&messages).values().all(|lines| *lines == 50));

    pipeline.push(result(3, 2, 1)).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(output.messages().len(), 10);
    pipeline.stop(Duration::from_secs(1)).await;
    assert_eq!(output.messages().len(), 10);
}

#[tokio::test(start_paused = true)]
async fn size_cap_flushes_early() {
    use crate::outputs::ManualOutput;

    let output = Arc::new(ManualOutput::new(1024 * 1024));
    let config = EvaluationConfig {
        max_batch_bytes: 200,
        ..test_config()
    };
    let pipeline = EvaluationPipeline::spawn(
        &config,
        output.clone(),
        Arc::new(TrainerMetrics::detached()),
    );
    for _ in 0..10 {
        pipeline.push(result(1, 1, 1)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let deployed: Vec<_> = output
        .messages()
        .into_iter()
        .filter(|(policy, _)| policy == DEPLOYED_POLICY)
        .collect();
    assert!(deployed.len() >= 4, "{deployed:?}");
    assert!(deployed.iter().all(|(_, message)| message.len() <= 200));

    pipeline.stop(Duration::from_secs(1)).await;
    let lines = lines_per_policy(&output.messages());
    assert_eq!(lines[DEPLOYED_POLICY], 10);
    assert_eq!(lines[LATEST_POLICY], 10);
    assert_eq!(lines["Constant Policy 1"], 10);
}

#[tokio::test(start_paused = true)]
async fn stop_flushes_open_windows() {
    use crate::outputs::ManualOutput;

    let output = Arc::new(ManualOutput::new(1024 * 1024));
    let pipeline = EvaluationPipeline::spawn(
        &test_config(),
        output.clone(),
        Arc::new(TrainerMetrics::detached()),
    );
    for _ in 0..7 {
        pipeline.push(result(2, 1, 2)).await;
    }
    pipeline.stop(Duration::from_secs(1)).await;

    let lines = lines_per_policy(&output.messages());
    assert_eq!(lines.len(), 4);
    assert!(lines.values().all(|lines| *lines == 7), "{lines:?}");
}

#[cfg(test)]
struct RejectDeployed(crate::outputs::ManualOutput);

#[cfg(test)]
#[async_trait]
impl OutputSink for RejectDeployed {
    fn max_message_size(&self) -> usize {
        self.0.max_message_size()
    }

    async fn send(&self, key: &str, message: Vec<u8>) -> Result<(), crate::errors::OutputError> {
        if key == DEPLOYED_POLICY {
            return Err(crate::errors::OutputError::Closed);
        }
        self.0.send(key, message).await
    }
}

#[tokio::test(start_paused = true)]
async fn failed_batch_does_not_stop_pipeline() {
    let output = Arc::new(RejectDeployed(crate::outputs::ManualOutput::new(1024 * 1024)));
    let pipeline = EvaluationPipeline::spawn(
        &test_config(),
        output.clone(),
        Arc::new(TrainerMetrics::detached()),
    );
    pipeline.push(result(1, 1, 1)).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    pipeline.push(result(1, 1, 1)).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    pipeline.stop(Duration::from_secs(1)).await;

    let lines = lines_per_policy(&output.0.messages());
    assert_eq!(lines.get(DEPLOYED_POLICY), None);
    assert_eq!(lines[LATEST_POLICY], 2);
    assert_eq!(lines["Constant Policy 1"], 2);
}

#[tokio::test(start_paused = true)]
async fn reports_running_means() {
    use crate::outputs::NoOpOutput;

    let config = EvaluationConfig {
        report_window_ms: 1_000,
        ..test_config()
    };
    let pipeline = EvaluationPipeline::spawn(
        &config,
        Arc::new(NoOpOutput),
        Arc::new(TrainerMetrics::detached()),
    );
    let summaries = pipeline.summaries();
    pipeline.push(result(2, 1, 1)).await;
    pipeline.push(result(2, 2, 1)).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    {
        let summaries = summaries.borrow();
        assert_eq!(summaries[DEPLOYED_POLICY].records, 2);
        assert!((summaries[DEPLOYED_POLICY].mean_cost + 4.0).abs() < 1e-9);
        assert!((summaries["Constant Policy 1"].mean_cost + 2.0).abs() < 1e-9);
        assert!((summaries[LATEST_POLICY].mean_cost + 2.0).abs() < 1e-9);
    }
    pipeline.stop(Duration::from_secs(1)).await;
}
