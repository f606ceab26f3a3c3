//! Trainer configuration.
//!
//! Loaded from a JSON file; every field has a default so an empty
//! object `{}` is a valid configuration. A few fields can be
//! overridden from the command line, see `main.rs`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Where checkpoints are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StorageBackend {
    /// Lost on exit. Useful for trying things out.
    Memory,
    Sqlite { path: PathBuf },
    /// Never checkpoint; always fresh start.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Name of the container all checkpoint objects live in.
    pub container: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            container: "cbtrainer".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Checkpoint after this many learned examples.
    pub every_examples: u64,
    /// Seconds between timed checkpoints. `0` disables them.
    pub interval: u64,
    /// Advance the latest-model pointer on every k-th checkpoint. `0`
    /// never publishes.
    pub publish_model_every: u64,
    /// Seconds a single checkpoint write may take.
    pub write_timeout: u64,
    /// Take a final checkpoint on graceful shutdown.
    pub on_shutdown: bool,
    /// Checkpoints waiting to be written before new ones are dropped.
    pub queue_depth: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every_examples: 100_000,
            interval: 300,
            publish_model_every: 1,
            write_timeout: 60,
            on_shutdown: true,
            queue_depth: 4,
        }
    }
}

impl CheckpointConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval > 0).then(|| Duration::from_secs(self.interval))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_batch_bytes: usize,
    /// Learn results expanded concurrently.
    pub parallelism: usize,
    /// Learn results waiting to be expanded before the learner
    /// blocks.
    pub queue_depth: usize,
    /// Seconds to drain on shutdown.
    pub shutdown_timeout: u64,
    /// Window of the per-policy summary log.
    pub report_window_ms: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 5_000,
            max_batch_bytes: 245 * 1024,
            parallelism: 4,
            queue_depth: 1024,
            shutdown_timeout: 10,
            report_window_ms: 10_000,
        }
    }
}

impl EvaluationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn report_window(&self) -> Duration {
        Duration::from_millis(self.report_window_ms)
    }
}

/// Where decision events are read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum InputConfig {
    /// A JSON-lines file.
    File { path: PathBuf },
    /// JSON lines on stdin.
    Stdin,
}

/// Where evaluation batches are sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OutputConfig {
    Stdout,
    File { path: PathBuf },
    None,
}

/// Export traces to an OpenTelemetry collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtlpConfig {
    /// Identifies this trainer.
    pub service_name: String,
    /// Collector's URL, defaults to `grpc://127.0.0.1:4317`.
    #[serde(default)]
    pub url: Option<String>,
    /// `>= 1` samples all traces, `<= 0` almost none.
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_sampling_ratio() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub engine_args: String,
    pub storage: StorageConfig,
    pub checkpoint: CheckpointConfig,
    pub evaluation: EvaluationConfig,
    pub stats_window_ms: u64,
    pub input: InputConfig,
    pub output: OutputConfig,
    /// Serve `/metrics` and `/status` on this port.
    pub api_port: Option<u16>,
    pub log_level: String,
    pub otlp: Option<OtlpConfig>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            engine_args: "--bits 18 --learning_rate 0.5 --power_t 0.5 --epsilon 0.2".to_owned(),
            storage: StorageConfig::default(),
            checkpoint: CheckpointConfig::default(),
            evaluation: EvaluationConfig::default(),
            stats_window_ms: 5_000,
            input: InputConfig::Stdin,
            output: OutputConfig::Stdout,
            api_port: None,
            log_level: "info".to_owned(),
            otlp: None,
        }
    }
}

impl TrainerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn stats_window(&self) -> Duration {
        Duration::from_millis(self.stats_window_ms)
    }
}

#[test]
fn empty_config_is_default() {
    let config: TrainerConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config, TrainerConfig::default());
    assert_eq!(config.evaluation.max_batch_bytes, 250_880);
    assert_eq!(config.checkpoint.interval(), Some(Duration::from_secs(300)));
}

#[test]
fn load_works() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "storage": {{"backend": {{"kind": "sqlite", "path": "/tmp/ckpt.sqlite3"}}, "container": "prod"}},
            "checkpoint": {{"every_examples": 10, "interval": 0}},
            "input": {{"kind": "file", "path": "events.jsonl"}},
            "output": {{"kind": "none"}},
            "otlp": {{"service_name": "trainer"}}
        }}"#
    )
    .unwrap();

    let config = TrainerConfig::load(file.path()).unwrap();
    assert_eq!(
        config.storage.backend,
        StorageBackend::Sqlite {
            path: "/tmp/ckpt.sqlite3".into()
        }
    );
    assert_eq!(config.storage.container, "prod");
    assert_eq!(config.checkpoint.every_examples, 10);
    assert_eq!(config.checkpoint.interval(), None);
    assert_eq!(config.checkpoint.publish_model_every, 1);
    assert_eq!(config.output, OutputConfig::None);
    assert_eq!(config.otlp.unwrap().sampling_ratio, 1.0);
}

#[test]
fn load_reports_path() {
    let err = TrainerConfig::load(Path::new("/does/not/exist.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
    assert!(err.to_string().contains("/does/not/exist.json"));
}
