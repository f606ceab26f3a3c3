use std::sync::Arc;

use cbtrainer::checkpoint::CheckpointPolicy;
use cbtrainer::engine::marshal::to_engine_example;
use cbtrainer::engine::{EngineArgs, LinearEngineFactory};
use cbtrainer::event::{DecisionEvent, Label, Offset};
use cbtrainer::learner::{Learner, LearnerContext};
use cbtrainer::metrics::TrainerMetrics;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

fn event(i: u64) -> DecisionEvent {
    DecisionEvent {
        event_id: format!("e{i}"),
        partition: "0".into(),
        offset: Offset(i),
        timestamp: chrono::Utc::now(),
        actions: 4,
        context: serde_json::json!({
            "user": {"country": "NL", "device": "mobile", "visits": i % 17},
            "page": {"section": "sports", "tags": ["football", "live"]},
        }),
        label: Label {
            action: (i % 4) as u32 + 1,
            probability: 0.25,
            cost: if i % 3 == 0 { -1.0 } else { 0.0 },
        },
    }
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let events: Vec<_> = (0..1_000).map(event).collect();

    let mut group = c.benchmark_group("learn");
    group.throughput(Throughput::Elements(events.len() as u64));
    group.bench_function(BenchmarkId::new("marshal", events.len()), |b| {
        let mut buffer = Vec::new();
        b.iter(|| {
            for event in &events {
                let example = to_engine_example(event, std::mem::take(&mut buffer)).unwrap();
                buffer = example.features;
            }
        });
    });
    for bits in [10, 18] {
        let ctx = LearnerContext {
            factory: Arc::new(LinearEngineFactory),
            args: EngineArgs::parse(&format!("--bits {bits}")).unwrap(),
            policy: CheckpointPolicy::every(0),
            metrics: Arc::new(TrainerMetrics::detached()),
        };
        group.bench_function(BenchmarkId::new("marshal_and_learn", bits), |b| {
            b.iter_batched(
                || Learner::fresh_start(&ctx).unwrap(),
                |mut learner| {
                    for event in &events {
                        learner.learn(event);
                    }
                    learner
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
