//! Trainer metrics.
//!
//! Instruments are created once from an injected [`Meter`] and passed
//! around in a [`TrainerMetrics`]; nothing reads a global meter
//! provider. [`initialize_metrics`] builds the provider used by the
//! binary, which exports into a private Prometheus registry served on
//! `/metrics` by [`crate::webserver`].

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::sdk::metrics::{Aggregation, Instrument, MeterProvider, Stream};
use opentelemetry::KeyValue;
use prometheus::Registry;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

const SECONDS_BUCKETS: [f64; 16] = [
    0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Create a Prometheus registry and a MeterProvider exporting to it.
///
/// Keep the provider alive for as long as metrics should be
/// collected.
pub fn initialize_metrics() -> Result<(MeterProvider, Registry), opentelemetry::metrics::MetricsError> {
    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("cbtrainer")
        .build()?;

    let seconds = || {
        Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
            boundaries: SECONDS_BUCKETS.to_vec(),
            record_min_max: true,
        })
    };
    let provider = MeterProvider::builder()
        .with_reader(exporter)
        // Must match histogram names.
        .with_view(opentelemetry_sdk::metrics::new_view(
            Instrument::new().name("*duration*"),
            seconds(),
        )?)
        .with_view(opentelemetry_sdk::metrics::new_view(
            Instrument::new().name("*latency*"),
            seconds(),
        )?)
        .build();
    Ok((provider, registry))
}

/// All instruments the trainer records into.
pub struct TrainerMetrics {
    pub examples_learned: Counter<u64>,
    pub learn_failures: Counter<u64>,
    pub events_skipped: Counter<u64>,
    pub features_per_example: Histogram<u64>,
    pub event_latency: Histogram<f64>,
    pub learn_duration: Histogram<f64>,

    pub checkpoints_created: Counter<u64>,
    pub checkpoints_written: Counter<u64>,
    pub checkpoints_failed: Counter<u64>,
    pub checkpoints_dropped: Counter<u64>,
    pub checkpoint_write_duration: Histogram<f64>,
    pub recoveries: Counter<u64>,

    pub evaluation_records: Counter<u64>,
    pub evaluation_batches_sent: Counter<u64>,
    pub evaluation_batches_failed: Counter<u64>,
    pub evaluation_batch_bytes: Histogram<u64>,

    pub input_parse_failures: Counter<u64>,
}

impl TrainerMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            examples_learned: meter
                .u64_counter("examples_learned")
                .with_description("number of examples the engine learned from")
                .init(),
            learn_failures: meter
                .u64_counter("learn_failures")
                .with_description("number of events that could not be learned, by reason")
                .init(),
            events_skipped: meter
                .u64_counter("events_skipped")
                .with_description("redelivered events at or before the recovered offset")
                .init(),
            features_per_example: meter
                .u64_histogram("features_per_example")
                .with_description("number of features in each learned example")
                .init(),
            event_latency: meter
                .f64_histogram("event_latency_seconds")
                .with_description("time from the decision event to it being learned")
                .init(),
            learn_duration: meter
                .f64_histogram("learn_duration_seconds")
                .with_description("time to marshal and learn one event")
                .init(),
            checkpoints_created: meter
                .u64_counter("checkpoints_created")
                .with_description("checkpoint payloads created by the learner")
                .init(),
            checkpoints_written: meter
                .u64_counter("checkpoints_written")
                .with_description("checkpoints durably written")
                .init(),
            checkpoints_failed: meter
                .u64_counter("checkpoints_failed")
                .with_description("checkpoint writes abandoned on error or timeout")
                .init(),
            checkpoints_dropped: meter
                .u64_counter("checkpoints_dropped")
                .with_description("checkpoint payloads dropped because the write queue was full")
                .init(),
            checkpoint_write_duration: meter
                .f64_histogram("checkpoint_write_duration_seconds")
                .with_description("time to write one checkpoint")
                .init(),
            recoveries: meter
                .u64_counter("recoveries")
                .with_description("recovery candidates tried, by outcome")
                .init(),
            evaluation_records: meter
                .u64_counter("evaluation_records")
                .with_description("policy evaluation records produced, by policy")
                .init(),
            evaluation_batches_sent: meter
                .u64_counter("evaluation_batches_sent")
                .with_description("evaluation batches sent to the output")
                .init(),
            evaluation_batches_failed: meter
                .u64_counter("evaluation_batches_failed")
                .with_description("evaluation batches the output rejected")
                .init(),
            evaluation_batch_bytes: meter
                .u64_histogram("evaluation_batch_bytes")
                .with_description("size of each sent evaluation batch")
                .init(),
            input_parse_failures: meter
                .u64_counter("input_parse_failures")
                .with_description("input lines which were not valid decision events")
                .init(),
        }
    }

    /// Metrics that go nowhere.
    pub fn detached() -> Self {
        use opentelemetry::metrics::MeterProvider as _;

        Self::new(&opentelemetry::metrics::noop::NoopMeterProvider::new().meter("cbtrainer"))
    }
}

/// A single label, e.g. `label("reason", "marshal")`.
pub fn label(key: &'static str, value: impl Into<opentelemetry::Value>) -> [KeyValue; 1] {
    [KeyValue::new(key, value)]
}

#[test]
fn exports_to_registry() {
    use opentelemetry::metrics::MeterProvider as _;

    let (provider, registry) = initialize_metrics().unwrap();
    let metrics = TrainerMetrics::new(&provider.meter("cbtrainer"));
    metrics.examples_learned.add(3, &[]);
    metrics.learn_duration.record(0.002, &[]);
    metrics.learn_failures.add(1, &label("reason", "marshal"));

    let families = registry.gather();
    let names: Vec<_> = families.iter().map(|family| family.get_name()).collect();
    assert!(
        names.iter().any(|name| name.starts_with("cbtrainer_examples_learned")),
        "{names:?}"
    );
    assert!(
        names.iter().any(|name| name.starts_with("cbtrainer_learn_duration_seconds")),
        "{names:?}"
    );
}
