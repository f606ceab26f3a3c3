use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{check_size, keyed_lines, OutputSink, DEFAULT_MAX_MESSAGE_SIZE};
use crate::errors::OutputError;

/// Print messages to standard out.
pub struct StdOutput {
    stdout: Mutex<tokio::io::Stdout>,
}

impl StdOutput {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutputSink for StdOutput {
    fn max_message_size(&self) -> usize {
        DEFAULT_MAX_MESSAGE_SIZE
    }

    async fn send(&self, key: &str, message: Vec<u8>) -> Result<(), OutputError> {
        check_size(&message, self.max_message_size())?;
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(&keyed_lines(key, &message)).await?;
        stdout.flush().await?;
        Ok(())
    }
}
