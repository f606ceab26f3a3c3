//! A linear cost-sensitive engine with epsilon-greedy exploration.
//!
//! Each action has its own sparse linear regressor of expected cost
//! over the hashed features. Learning is an importance-weighted,
//! normalized gradient step on the logged action only. The weights
//! serialize to JSON together with the arguments that produced them.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{ActionProbability, Engine, EngineArgs, EngineFactory, Example, Feature, Prediction};
use crate::errors::EngineError;

/// Buffers kept around for reuse by [`Engine::acquire_features`].
const MAX_POOLED_BUFFERS: usize = 64;

/// What [`LinearEngine::serialize_weights`] writes.
#[derive(Debug, Serialize, Deserialize)]
struct ModelFile {
    args: EngineArgs,
    examples_seen: u64,
    /// Non-zero weights per action, action 1 first.
    weights: Vec<BTreeMap<u32, f32>>,
}

pub struct LinearEngine {
    args: EngineArgs,
    mask: u64,
    examples_seen: u64,
    weights: Vec<HashMap<u32, f32>>,
    pool: Vec<Vec<Feature>>,
}

impl LinearEngine {
    pub fn new(args: EngineArgs) -> Self {
        Self::with_weights(args, 0, Vec::new())
    }

    fn with_weights(args: EngineArgs, examples_seen: u64, weights: Vec<HashMap<u32, f32>>) -> Self {
        let mask = (1u64 << args.bits) - 1;
        Self {
            args,
            mask,
            examples_seen,
            weights,
            pool: Vec::new(),
        }
    }

    fn slot(&self, feature: &Feature) -> u32 {
        (feature.index & self.mask) as u32
    }

    fn score(&self, action: u32, features: &[Feature]) -> f32 {
        let Some(weights) = self.weights.get(action as usize - 1) else {
            return 0.0;
        };
        features
            .iter()
            .map(|f| weights.get(&self.slot(f)).copied().unwrap_or_default() * f.value)
            .sum()
    }

    /// Epsilon-greedy over the predicted costs; ties go to the lower
    /// action.
    fn predict(&self, example: &Example) -> Prediction {
        let actions = example.actions;
        let mut best = 1;
        let mut best_score = f32::INFINITY;
        for action in 1..=actions {
            let score = self.score(action, &example.features);
            if score < best_score {
                best = action;
                best_score = score;
            }
        }

        let explore = self.args.epsilon / actions as f32;
        let mut dist = Vec::with_capacity(actions as usize);
        dist.push(ActionProbability {
            action: best,
            probability: 1.0 - self.args.epsilon + explore,
        });
        dist.extend((1..=actions).filter(|a| *a != best).map(|action| ActionProbability {
            action,
            probability: explore,
        }));
        Prediction(dist)
    }
}

impl Engine for LinearEngine {
    fn learn(&mut self, example: &mut Example) -> Result<Prediction, EngineError> {
        let label = example
            .label
            .ok_or_else(|| EngineError::InvalidExample("example has no label".to_owned()))?;
        if label.action == 0 || label.action > example.actions {
            return Err(EngineError::InvalidExample(format!(
                "label action {} is outside 1..={}",
                label.action, example.actions
            )));
        }

        let prediction = self.predict(example);

        let norm: f32 = example.features.iter().map(|f| f.value * f.value).sum();
        if norm > 0.0 {
            let rate = self.args.learning_rate
                / ((1 + self.examples_seen) as f32).powf(self.args.power_t);
            let importance = 1.0 / label.probability;
            let error = self.score(label.action, &example.features) - label.cost;
            let step = rate * importance * error / norm;

            let idx = label.action as usize - 1;
            let current = self.weights.get(idx);
            let mut updates: HashMap<u32, f32> = HashMap::new();
            for feature in &example.features {
                let slot = self.slot(feature);
                let weight = updates.entry(slot).or_insert_with(|| {
                    current
                        .and_then(|weights| weights.get(&slot))
                        .copied()
                        .unwrap_or_default()
                });
                *weight -= step * feature.value;
            }
            // Weights must stay serializable.
            if !step.is_finite() || updates.values().any(|w| !w.is_finite()) {
                return Err(EngineError::InvalidExample(format!(
                    "update of action {} is not finite",
                    label.action
                )));
            }

            if self.weights.len() <= idx {
                self.weights.resize_with(idx + 1, HashMap::new);
            }
            self.weights[idx].extend(updates);
        }
        self.examples_seen += 1;

        Ok(prediction)
    }

    fn acquire_features(&mut self) -> Vec<Feature> {
        self.pool.pop().unwrap_or_default()
    }

    fn finish_example(&mut self, example: Example) {
        if self.pool.len() < MAX_POOLED_BUFFERS {
            let mut features = example.features;
            features.clear();
            self.pool.push(features);
        }
    }

    fn serialize_weights(&self) -> Result<Vec<u8>, EngineError> {
        let model = ModelFile {
            args: EngineArgs {
                save_resume: false,
                ..self.args.clone()
            },
            examples_seen: self.examples_seen,
            weights: self
                .weights
                .iter()
                .map(|weights| {
                    weights
                        .iter()
                        .filter(|(_, w)| **w != 0.0)
                        .map(|(slot, w)| (*slot, *w))
                        .collect()
                })
                .collect(),
        };
        Ok(serde_json::to_vec(&model)?)
    }

    fn args(&self) -> &EngineArgs {
        &self.args
    }
}

/// Builds [`LinearEngine`]s.
#[derive(Debug, Default, Clone)]
pub struct LinearEngineFactory;

impl EngineFactory for LinearEngineFactory {
    fn initialize(
        &self,
        args: &EngineArgs,
        initial_weights: Option<&[u8]>,
    ) -> Result<Box<dyn Engine>, EngineError> {
        let Some(bytes) = initial_weights else {
            return Ok(Box::new(LinearEngine::new(args.clone())));
        };

        let model: ModelFile = serde_json::from_slice(bytes)
            .map_err(|err| EngineError::CorruptModel(err.to_string()))?;
        if !model.args.is_compatible_with(args) {
            return Err(EngineError::IncompatibleArgs {
                saved: model.args.to_string(),
                configured: args.to_string(),
            });
        }
        let examples_seen = if args.save_resume {
            model.examples_seen
        } else {
            0
        };
        let engine_args = EngineArgs {
            save_resume: args.save_resume,
            ..model.args
        };
        let weights = model
            .weights
            .into_iter()
            .map(|weights| weights.into_iter().collect())
            .collect();
        Ok(Box::new(LinearEngine::with_weights(
            engine_args,
            examples_seen,
            weights,
        )))
    }
}

#[cfg(test)]
fn example(action: u32, cost: f32) -> Example {
    use crate::event::Label;

    Example {
        features: vec![
            Feature {
                index: 1,
                value: 1.0,
            },
            Feature {
                index: 2,
                value: 1.0,
            },
        ],
        actions: 3,
        label: Some(Label {
            action,
            probability: 1.0 / 3.0,
            cost,
        }),
    }
}

#[test]
fn learns_cheapest_action() {
    let mut engine = LinearEngine::new(EngineArgs::parse("--bits 8 --epsilon 0.3").unwrap());
    for _ in 0..50 {
        engine.learn(&mut example(1, 1.0)).unwrap();
        engine.learn(&mut example(2, -1.0)).unwrap();
        engine.learn(&mut example(3, 0.5)).unwrap();
    }
    let prediction = engine.learn(&mut example(2, -1.0)).unwrap();
    assert_eq!(prediction.chosen_action(), Some(2));

    let total: f32 = prediction.0.iter().map(|ap| ap.probability).sum();
    assert!((total - 1.0).abs() < 1e-5);
    assert!((prediction.0[0].probability - 0.8).abs() < 1e-5);
}

#[test]
fn learn_requires_label() {
    let mut engine = LinearEngine::new(EngineArgs::default());
    let mut unlabeled = example(1, 0.0);
    unlabeled.label = None;
    assert!(matches!(
        engine.learn(&mut unlabeled),
        Err(EngineError::InvalidExample(_))
    ));
}

#[test]
fn non_finite_update_leaves_weights_untouched() {
    let mut engine = LinearEngine::new(EngineArgs::default());
    engine.learn(&mut example(1, -1.0)).unwrap();
    let before = engine.serialize_weights().unwrap();

    assert!(matches!(
        engine.learn(&mut example(1, f32::INFINITY)),
        Err(EngineError::InvalidExample(_))
    ));
    assert!(matches!(
        engine.learn(&mut example(2, f32::NAN)),
        Err(EngineError::InvalidExample(_))
    ));
    assert_eq!(engine.serialize_weights().unwrap(), before);
    assert!(LinearEngineFactory
        .initialize(&EngineArgs::default(), Some(&before))
        .is_ok());
}

#[test]
fn weights_restore_with_save_resume() {
    let args = EngineArgs::parse("--bits 8").unwrap();
    let mut engine = LinearEngine::new(args.clone());
    for _ in 0..10 {
        engine.learn(&mut example(3, -2.0)).unwrap();
    }
    let bytes = engine.serialize_weights().unwrap();

    let mut restored = LinearEngineFactory
        .initialize(&args.with_save_resume(), Some(&bytes))
        .unwrap();
    assert!(restored.args().save_resume);
    assert_eq!(restored.serialize_weights().unwrap(), bytes);
    let prediction = restored.learn(&mut example(1, 0.0)).unwrap();
    assert_eq!(prediction.chosen_action(), Some(3));
}

#[test]
fn incompatible_bits_fail() {
    let engine = LinearEngine::new(EngineArgs::parse("--bits 8").unwrap());
    let bytes = engine.serialize_weights().unwrap();
    let res = LinearEngineFactory.initialize(&EngineArgs::parse("--bits 10").unwrap(), Some(&bytes));
    assert!(matches!(res, Err(EngineError::IncompatibleArgs { .. })));
}

#[test]
fn garbage_weights_are_corrupt() {
    let res = LinearEngineFactory.initialize(&EngineArgs::default(), Some(b"not json"));
    assert!(matches!(res, Err(EngineError::CorruptModel(_))));
}

#[test]
fn finished_buffers_are_reused() {
    let mut engine = LinearEngine::new(EngineArgs::default());
    let ex = example(1, 0.0);
    let capacity = ex.features.capacity();
    engine.finish_example(ex);
    let buffer = engine.acquire_features();
    assert!(buffer.is_empty());
    assert_eq!(buffer.capacity(), capacity);
}
