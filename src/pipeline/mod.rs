//! Background pipelines fed by the learner.

pub mod evaluation;
pub mod rate_limited;
pub mod stats;
