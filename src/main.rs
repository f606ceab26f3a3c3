use std::path::PathBuf;

use cbtrainer::config::{InputConfig, TrainerConfig};
use cbtrainer::errors::TrainerError;
use cbtrainer::Trainer;
use clap::Parser;

/// Train a contextual bandit model from a stream of decision events.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON config file; every setting has a default.
    #[arg(long, env = "CBTRAINER_CONFIG")]
    config: Option<PathBuf>,

    /// Read events from this JSON lines file instead of the configured
    /// input. `-` reads stdin.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Log level when `CBTRAINER_LOG` is unset.
    #[arg(long)]
    log_level: Option<String>,

    /// Serve `/metrics` and `/status` on this port.
    #[arg(long, env = "CBTRAINER_API_PORT")]
    api_port: Option<u16>,
}

impl Args {
    fn into_config(self) -> Result<TrainerConfig, TrainerError> {
        let mut config = match &self.config {
            Some(path) => TrainerConfig::load(path)?,
            None => TrainerConfig::default(),
        };
        if let Some(path) = self.input {
            config.input = if path.as_os_str() == "-" {
                InputConfig::Stdin
            } else {
                InputConfig::File { path }
            };
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if self.api_port.is_some() {
            config.api_port = self.api_port;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), TrainerError> {
    let config = Args::parse().into_config()?;
    cbtrainer::tracing::setup(&config.log_level, config.otlp.as_ref())?;

    let trainer = Trainer::from_config(config)?;
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Unable to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };
    trainer.run(shutdown).await?;
    Ok(())
}
