//! Interface to the learning engine.
//!
//! Architecture
//! ------------
//!
//! The trainer only talks to an engine through the [`Engine`] and
//! [`EngineFactory`] traits. The engine's math is opaque: it learns
//! from an [`Example`], returns a progressive [`Prediction`] made
//! before the update, and can serialize its weights so they can be
//! checkpointed and handed back to [`EngineFactory::initialize`]
//! later.
//!
//! Examples are built by [`marshal::to_engine_example`] out of a
//! feature buffer the engine lends via [`Engine::acquire_features`].
//! Every example must be given back with [`Engine::finish_example`]
//! whether learning succeeded or not.
//!
//! [`linear::LinearEngine`] is the engine shipped with the crate.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::event::Label;

pub mod linear;
pub mod marshal;

pub use linear::LinearEngineFactory;

/// A single hashed feature.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Feature {
    pub index: u64,
    pub value: f32,
}

/// An engine-ready example.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Example {
    pub features: Vec<Feature>,
    pub actions: u32,
    pub label: Option<Label>,
}

impl Example {
    pub fn feature_count(&self) -> usize {
        self.features.len()
    }
}

/// Probability the policy assigns to an action.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProbability {
    pub action: u32,
    pub probability: f32,
}

/// Action distribution with the chosen action first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prediction(pub Vec<ActionProbability>);

impl Prediction {
    /// The action the policy would take.
    pub fn chosen_action(&self) -> Option<u32> {
        self.0.first().map(|ap| ap.action)
    }
}

/// Engine arguments.
///
/// Parsed from and rendered to a command-line style string, e.g.
/// `--bits 18 --learning_rate 0.5 --power_t 0.5 --epsilon 0.2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineArgs {
    /// Log2 of the weight table size per action.
    pub bits: u8,
    pub learning_rate: f32,
    pub power_t: f32,
    /// Exploration probability spread over all actions.
    pub epsilon: f32,
    /// Restore learning progress along with the weights.
    pub save_resume: bool,
}

impl Default for EngineArgs {
    fn default() -> Self {
        Self {
            bits: 18,
            learning_rate: 0.5,
            power_t: 0.5,
            epsilon: 0.2,
            save_resume: false,
        }
    }
}

impl EngineArgs {
    pub fn parse(args: &str) -> Result<Self, EngineError> {
        fn value<'a, T: std::str::FromStr>(
            flag: &str,
            tokens: &mut impl Iterator<Item = &'a str>,
        ) -> Result<T, EngineError> {
            tokens
                .next()
                .and_then(|token| token.parse().ok())
                .ok_or_else(|| EngineError::InvalidArgs(format!("`{flag}` needs a valid value")))
        }

        let mut parsed = Self::default();
        let mut tokens = args.split_whitespace();
        while let Some(flag) = tokens.next() {
            match flag {
                "-b" | "--bits" => parsed.bits = value(flag, &mut tokens)?,
                "-l" | "--learning_rate" => parsed.learning_rate = value(flag, &mut tokens)?,
                "--power_t" => parsed.power_t = value(flag, &mut tokens)?,
                "--epsilon" => parsed.epsilon = value(flag, &mut tokens)?,
                "--save_resume" => parsed.save_resume = true,
                unknown => {
                    return Err(EngineError::InvalidArgs(format!(
                        "unknown argument `{unknown}`"
                    )))
                }
            }
        }

        if !(1..=30).contains(&parsed.bits) {
            return Err(EngineError::InvalidArgs(format!(
                "`--bits` must be in 1..=30; got {}",
                parsed.bits
            )));
        }
        if !(0.0..=1.0).contains(&parsed.epsilon) {
            return Err(EngineError::InvalidArgs(format!(
                "`--epsilon` must be in 0..=1; got {}",
                parsed.epsilon
            )));
        }
        Ok(parsed)
    }

    /// Same arguments, but restoring learning progress from the
    /// initial weights.
    pub fn with_save_resume(&self) -> Self {
        Self {
            save_resume: true,
            ..self.clone()
        }
    }

    /// Can a model trained with `self` continue training under
    /// `configured`?
    ///
    /// Only the weight layout matters; learning hyperparameters are
    /// taken from the saved model.
    pub fn is_compatible_with(&self, configured: &EngineArgs) -> bool {
        self.bits == configured.bits
    }
}

impl Display for EngineArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "--bits {} --learning_rate {} --power_t {} --epsilon {}",
            self.bits, self.learning_rate, self.power_t, self.epsilon
        )?;
        if self.save_resume {
            f.write_str(" --save_resume")?;
        }
        Ok(())
    }
}

/// A learning engine instance.
pub trait Engine: Send {
    /// Learn from a labeled example.
    ///
    /// Returns the prediction the engine would have made for this
    /// example before learning from it.
    fn learn(&mut self, example: &mut Example) -> Result<Prediction, EngineError>;

    /// Lend a feature buffer to build the next example in.
    fn acquire_features(&mut self) -> Vec<Feature> {
        Vec::new()
    }

    /// Release any resources held by an example.
    fn finish_example(&mut self, example: Example);

    /// Serialize the current weights, including the arguments they
    /// were trained with.
    fn serialize_weights(&self) -> Result<Vec<u8>, EngineError>;

    fn args(&self) -> &EngineArgs;
}

/// Builds engines.
pub trait EngineFactory: Send + Sync {
    /// Create an engine.
    ///
    /// If `initial_weights` were produced with arguments that are not
    /// compatible with `args`, this must fail with
    /// [`EngineError::IncompatibleArgs`].
    fn initialize(
        &self,
        args: &EngineArgs,
        initial_weights: Option<&[u8]>,
    ) -> Result<Box<dyn Engine>, EngineError>;
}

#[test]
fn args_parse_works() {
    let args = EngineArgs::parse("--bits 10 -l 0.1 --power_t 0 --epsilon 0.05 --save_resume")
        .unwrap();
    let expected = EngineArgs {
        bits: 10,
        learning_rate: 0.1,
        power_t: 0.0,
        epsilon: 0.05,
        save_resume: true,
    };
    assert_eq!(args, expected);
}

#[test]
fn args_display_parses_back() {
    let args = EngineArgs::default().with_save_resume();
    assert_eq!(EngineArgs::parse(&args.to_string()).unwrap(), args);
}

#[test]
fn args_parse_rejects_unknown() {
    assert!(matches!(
        EngineArgs::parse("--cb_explore 4"),
        Err(EngineError::InvalidArgs(_))
    ));
    assert!(matches!(
        EngineArgs::parse("--bits"),
        Err(EngineError::InvalidArgs(_))
    ));
    assert!(matches!(
        EngineArgs::parse("--bits 40"),
        Err(EngineError::InvalidArgs(_))
    ));
}

#[test]
fn args_compatibility_is_layout_only() {
    let configured = EngineArgs::parse("--bits 12").unwrap();
    let saved = EngineArgs::parse("--bits 12 --learning_rate 2").unwrap();
    assert!(saved.is_compatible_with(&configured));
    let saved = EngineArgs::parse("--bits 14").unwrap();
    assert!(!saved.is_compatible_with(&configured));
}
