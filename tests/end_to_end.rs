use std::io::Write;
use std::sync::Arc;

use cbtrainer::checkpoint::{CheckpointPolicy, CheckpointWriter, Trackback, TrainerState, LATEST_STATE};
use cbtrainer::config::TrainerConfig;
use cbtrainer::engine::{EngineArgs, LinearEngineFactory};
use cbtrainer::event::{DecisionEvent, Label, Offset, PartitionKey};
use cbtrainer::learner::{Learner, LearnerContext, LearnerPhase};
use cbtrainer::metrics::TrainerMetrics;
use cbtrainer::recovery::RecoveryCoordinator;
use cbtrainer::storage::{InMemStore, ObjectStore};
use cbtrainer::Trainer;

fn event(id: &str, partition: &str, offset: u64) -> DecisionEvent {
    DecisionEvent {
        event_id: id.to_owned(),
        partition: partition.into(),
        offset: Offset(offset),
        timestamp: chrono::Utc::now(),
        actions: 3,
        context: serde_json::json!({"user": {"country": "NL"}, "hour": 13}),
        label: Label {
            action: 1,
            probability: 0.5,
            cost: -1.0,
        },
    }
}

fn context(every_examples: u64) -> LearnerContext {
    LearnerContext {
        factory: Arc::new(LinearEngineFactory),
        args: EngineArgs::parse("--bits 12").unwrap(),
        policy: CheckpointPolicy::every(every_examples),
        metrics: Arc::new(TrainerMetrics::detached()),
    }
}

#[tokio::test]
async fn checkpoint_then_recover() {
    let store = Arc::new(InMemStore::new());
    let ctx = context(2);

    let mut learner = Learner::fresh_start(&ctx).unwrap();
    assert!(learner.learn(&event("e1", "p", 1)).is_some());
    assert!(!learner.should_checkpoint());
    assert!(learner.learn(&event("e2", "p", 2)).is_some());
    assert!(learner.should_checkpoint());

    let payload = learner.checkpoint().unwrap();
    assert_eq!(payload.trackback_count, 2);
    let trackback = Trackback::parse(&payload.trackback).unwrap();
    assert_eq!(trackback.model_id, payload.model_id);
    assert_eq!(trackback.event_ids, vec!["e1", "e2"]);
    assert!(learner.trackback().is_empty());

    CheckpointWriter::new(store.clone())
        .write(&payload)
        .await
        .unwrap();

    let recovered = RecoveryCoordinator::new(store.clone(), ctx)
        .recover()
        .await
        .unwrap();
    assert_eq!(recovered.phase(), LearnerPhase::Resumed);
    assert_eq!(
        recovered.state().partition_offsets.get(&PartitionKey::from("p")),
        Some(&Offset(2))
    );
    assert_eq!(recovered.state().model_name, learner.state().model_name);

    let state = TrainerState::from_bytes(&store.get(LATEST_STATE).await.unwrap().unwrap()).unwrap();
    assert_eq!(state, *learner.state());
}

fn write_events(path: &std::path::Path, events: impl IntoIterator<Item = DecisionEvent>) {
    let mut file = std::fs::File::create(path).unwrap();
    for event in events {
        writeln!(file, "{}", serde_json::to_string(&event).unwrap()).unwrap();
    }
}

#[tokio::test]
async fn trainer_restarts_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let events_path = dir.path().join("events.jsonl");
    let output_path = dir.path().join("evaluation.txt");
    let config_path = dir.path().join("config.json");

    let config = serde_json::json!({
        "engine_args": "--bits 12",
        "storage": {
            "backend": {"kind": "sqlite", "path": dir.path().join("checkpoints.sqlite3")},
        },
        "checkpoint": {"every_examples": 3, "interval": 0},
        "evaluation": {"window_ms": 20, "report_window_ms": 20},
        "stats_window_ms": 20,
        "input": {"kind": "file", "path": events_path},
        "output": {"kind": "file", "path": output_path},
    });
    std::fs::write(&config_path, config.to_string()).unwrap();

    write_events(&events_path, (1..=4).map(|i| event(&format!("e{i}"), "p", i)));
    let trainer = Trainer::from_config(TrainerConfig::load(&config_path).unwrap()).unwrap();
    let learner = trainer.run(std::future::pending()).await.unwrap();
    assert_eq!(learner.phase(), LearnerPhase::Learning);
    assert_eq!(learner.status().examples_learned, 4);

    let output = std::fs::read_to_string(&output_path).unwrap();
    assert!(output.lines().any(|line| line.starts_with("Deployed Policy\t")));
    assert!(output.lines().any(|line| line.starts_with("Constant Policy 3\t")));

    // Redelivered events are skipped after the restart.
    write_events(&events_path, (1..=6).map(|i| event(&format!("e{i}"), "p", i)));
    let trainer = Trainer::from_config(TrainerConfig::load(&config_path).unwrap()).unwrap();
    let learner = trainer.run(std::future::pending()).await.unwrap();
    assert_eq!(learner.status().examples_learned, 2);
    assert_eq!(
        learner.state().partition_offsets.get(&PartitionKey::from("p")),
        Some(&Offset(6))
    );
}
