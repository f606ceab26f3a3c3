//! When to take checkpoints.

use std::time::Duration;

use crate::config::CheckpointConfig;

/// Decides when to checkpoint and when a checkpoint publishes its
/// model.
///
/// Pure; cheap enough to ask on every learned event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPolicy {
    /// `0` never checkpoints on count.
    pub every_examples: u64,
    /// Timed checkpoints, if any.
    pub interval: Option<Duration>,
    /// `0` never publishes.
    pub publish_model_every: u64,
}

impl CheckpointPolicy {
    pub fn every(examples: u64) -> Self {
        Self {
            every_examples: examples,
            interval: None,
            publish_model_every: 1,
        }
    }

    pub fn from_config(config: &CheckpointConfig) -> Self {
        Self {
            every_examples: config.every_examples,
            interval: config.interval(),
            publish_model_every: config.publish_model_every,
        }
    }

    /// Should we checkpoint after this many examples learned since
    /// the last checkpoint?
    pub fn should_checkpoint(&self, examples_since_checkpoint: u64) -> bool {
        examples_since_checkpoint > 0
            && self.every_examples > 0
            && examples_since_checkpoint >= self.every_examples
    }

    /// Should a timer tick checkpoint?
    pub fn should_checkpoint_on_tick(&self, examples_since_checkpoint: u64) -> bool {
        examples_since_checkpoint > 0 && self.interval.is_some()
    }

    /// Should the `nth` checkpoint (from 1) advance the latest-model
    /// pointer?
    pub fn publish_model(&self, nth: u64) -> bool {
        self.publish_model_every > 0 && nth % self.publish_model_every == 0
    }
}

#[test]
fn zero_never_checkpoints() {
    for threshold in [0, 1, 2, 100_000, u64::MAX] {
        let mut policy = CheckpointPolicy::every(threshold);
        policy.interval = Some(Duration::from_secs(1));
        assert!(!policy.should_checkpoint(0), "threshold {threshold}");
        assert!(!policy.should_checkpoint_on_tick(0), "threshold {threshold}");
    }
}

#[test]
fn threshold_works() {
    let policy = CheckpointPolicy::every(3);
    assert!(!policy.should_checkpoint(2));
    assert!(policy.should_checkpoint(3));
    assert!(policy.should_checkpoint(4));

    let never = CheckpointPolicy::every(0);
    assert!(!never.should_checkpoint(1_000_000));
}

#[test]
fn tick_needs_interval() {
    let policy = CheckpointPolicy::every(10);
    assert!(!policy.should_checkpoint_on_tick(5));
    let policy = CheckpointPolicy::from_config(&CheckpointConfig::default());
    assert!(policy.should_checkpoint_on_tick(5));
}

#[test]
fn publish_cadence_works() {
    let mut policy = CheckpointPolicy::every(1);
    assert!((1..=5).all(|n| policy.publish_model(n)));

    policy.publish_model_every = 3;
    let published: Vec<_> = (1..=7).filter(|n| policy.publish_model(*n)).collect();
    assert_eq!(published, vec![3, 6]);

    policy.publish_model_every = 0;
    assert!(!(1..=5).any(|n| policy.publish_model(n)));
}
