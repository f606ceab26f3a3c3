//! Error types for the trainer.
//!
//! Every component catches and reports its own failures on the hot
//! paths; the only error that is allowed to escape to the process
//! boundary is [`TrainerError`].

use std::panic::Location;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from an [`crate::storage::ObjectStore`].
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("object {0:?} does not exist")]
    MissingObject(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("sqlite migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("storage operation timed out")]
    Timeout,
}

/// Errors raised by a learning engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The saved model was trained with arguments that can't be
    /// combined with the configured ones.
    #[error("model arguments `{saved}` are incompatible with configured `{configured}`")]
    IncompatibleArgs { saved: String, configured: String },

    #[error("corrupt model: {0}")]
    CorruptModel(String),

    #[error("invalid engine arguments: {0}")]
    InvalidArgs(String),

    #[error("invalid example: {0}")]
    InvalidExample(String),

    #[error("error serializing weights: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors turning a decision event into an engine example.
#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("event context must be a JSON object")]
    ContextNotObject,

    #[error("event has no actions")]
    NoActions,

    #[error("logged action {action} is outside 1..={actions}")]
    ActionOutOfRange { action: u32, actions: u32 },

    #[error("logged probability {0} is not in (0, 1]")]
    InvalidProbability(f32),

    #[error("logged cost {0} is not finite")]
    NonFiniteCost(f32),

    #[error("event ID {0:?} contains a line break")]
    InvalidEventId(String),
}

/// Errors reading the event stream.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("I/O error reading events: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to parse event on line {line}: {source}")]
    Parse {
        line: u64,
        source: serde_json::Error,
    },
}

/// Errors sending to an output sink.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("I/O error writing output: {0}")]
    Io(#[from] std::io::Error),

    #[error("message of {size} bytes exceeds the sink maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("output closed")]
    Closed,
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid log level: {0}")]
    LogLevel(String),
}

/// Fatal errors which stop the trainer.
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("unable to initialize learning engine: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{msg}\nCaused by => {source}")]
    Context {
        msg: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Add a message and the caller's location to any error on its way
/// out to the process boundary.
///
/// Example:
///     store.ensure_container().await.reraise("error creating checkpoint container")?;
pub trait Reraise<T> {
    fn reraise(self, msg: &str) -> Result<T, TrainerError>;
}

impl<T, E> Reraise<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T, TrainerError> {
        let caller = Location::caller();
        self.map_err(|err| TrainerError::Context {
            msg: prepend_caller(caller, msg),
            source: Box::new(err),
        })
    }
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

#[test]
fn reraise_prepends_location() {
    let res: Result<(), std::io::Error> = Err(std::io::Error::new(
        std::io::ErrorKind::Other,
        "disk on fire",
    ));
    let err = res.reraise("error writing").unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("(src/errors.rs:"), "{msg}");
    assert!(msg.contains("error writing\nCaused by => disk on fire"), "{msg}");
}
