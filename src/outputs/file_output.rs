use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{check_size, keyed_lines, OutputSink, DEFAULT_MAX_MESSAGE_SIZE};
use crate::errors::OutputError;

/// Append messages to a file.
pub struct FileOutput {
    file: Mutex<tokio::fs::File>,
}

impl FileOutput {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> Result<Self, OutputError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        tracing::debug!("Writing evaluation output to {path:?}");
        Ok(Self {
            file: Mutex::new(tokio::fs::File::from_std(file)),
        })
    }
}

#[async_trait]
impl OutputSink for FileOutput {
    fn max_message_size(&self) -> usize {
        DEFAULT_MAX_MESSAGE_SIZE
    }

    async fn send(&self, key: &str, message: Vec<u8>) -> Result<(), OutputError> {
        check_size(&message, self.max_message_size())?;
        let mut file = self.file.lock().await;
        file.write_all(&keyed_lines(key, &message)).await?;
        file.flush().await?;
        Ok(())
    }
}

#[tokio::test]
async fn appends_keyed_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("evaluation.txt");

    let output = FileOutput::open(&path).unwrap();
    output.send("Latest Policy", b"a\nb\n".to_vec()).await.unwrap();
    drop(output);
    let output = FileOutput::open(&path).unwrap();
    output.send("Constant Policy 1", b"c\n".to_vec()).await.unwrap();
    drop(output);

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "Latest Policy\ta\nLatest Policy\tb\nConstant Policy 1\tc\n"
    );
}
