//! Where evaluation batches go.
//!
//! An [`OutputSink`] receives `(partition key, message)` pairs. It
//! knows the largest message it can accept so batching can stay
//! under it.
//!
//! Message bodies are newline-separated records. The text sinks write
//! each record on its own line prefixed with the partition key and a
//! tab.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::OutputConfig;
use crate::errors::OutputError;

pub mod file_output;
pub mod manual_output;
pub mod std_output;

pub use file_output::FileOutput;
pub use manual_output::ManualOutput;
pub use std_output::StdOutput;

/// Largest message the text sinks accept.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Largest `message` [`OutputSink::send`] will accept, in bytes.
    fn max_message_size(&self) -> usize;

    async fn send(&self, key: &str, message: Vec<u8>) -> Result<(), OutputError>;
}

/// Drops everything.
pub struct NoOpOutput;

#[async_trait]
impl OutputSink for NoOpOutput {
    fn max_message_size(&self) -> usize {
        DEFAULT_MAX_MESSAGE_SIZE
    }

    async fn send(&self, _key: &str, _message: Vec<u8>) -> Result<(), OutputError> {
        Ok(())
    }
}

pub fn build_output(config: &OutputConfig) -> Result<Arc<dyn OutputSink>, OutputError> {
    let output: Arc<dyn OutputSink> = match config {
        OutputConfig::Stdout => Arc::new(StdOutput::new()),
        OutputConfig::File { path } => Arc::new(FileOutput::open(path)?),
        OutputConfig::None => Arc::new(NoOpOutput),
    };
    Ok(output)
}

fn check_size(message: &[u8], max: usize) -> Result<(), OutputError> {
    if message.len() > max {
        return Err(OutputError::MessageTooLarge {
            size: message.len(),
            max,
        });
    }
    Ok(())
}

/// Prefix each line of `message` with `key` and a tab.
fn keyed_lines(key: &str, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + key.len() + 2);
    for line in message.split(|b| *b == b'\n').filter(|line| !line.is_empty()) {
        out.extend_from_slice(key.as_bytes());
        out.push(b'\t');
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    out
}

#[test]
fn keyed_lines_works() {
    assert_eq!(
        keyed_lines("Deployed Policy", b"{\"a\":1}\n{\"a\":2}\n"),
        b"Deployed Policy\t{\"a\":1}\nDeployed Policy\t{\"a\":2}\n".to_vec()
    );
    assert_eq!(keyed_lines("k", b""), Vec::<u8>::new());
}

#[test]
fn size_check_works() {
    assert!(check_size(b"1234", 4).is_ok());
    assert!(matches!(
        check_size(b"12345", 4),
        Err(OutputError::MessageTooLarge { size: 5, max: 4 })
    ));
}
