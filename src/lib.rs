//! Online contextual bandit trainer.
//!
//! Learns a contextual bandit model from a stream of joined decision
//! events, periodically checkpoints the model and the input position
//! to object storage, recovers from the newest usable checkpoint on
//! restart, and evaluates the learned policy against baselines.
//!
//! Start at [`run::Trainer`] for how the pieces fit together.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod errors;
pub mod event;
pub mod inputs;
pub mod learner;
pub mod metrics;
pub mod outputs;
pub mod pipeline;
pub mod recovery;
pub mod run;
pub mod storage;
pub mod tracing;
pub mod webserver;

pub use run::Trainer;
