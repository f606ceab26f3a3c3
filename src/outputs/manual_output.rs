use std::sync::Mutex;

use async_trait::async_trait;

use super::{check_size, OutputSink};
use crate::errors::OutputError;

/// Keeps every message in memory.
///
/// Mostly useful in tests.
pub struct ManualOutput {
    max_message_size: usize,
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl ManualOutput {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Everything sent so far, in order.
    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl OutputSink for ManualOutput {
    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    async fn send(&self, key: &str, message: Vec<u8>) -> Result<(), OutputError> {
        check_size(&message, self.max_message_size)?;
        self.messages
            .lock()
            .map_err(|_| OutputError::Closed)?
            .push((key.to_owned(), message));
        Ok(())
    }
}

#[tokio::test]
async fn keeps_messages() {
    let output = ManualOutput::new(4);
    output.send("a", b"1".to_vec()).await.unwrap();
    assert!(output.send("b", b"12345".to_vec()).await.is_err());
    output.send("c", b"3".to_vec()).await.unwrap();
    assert_eq!(
        output.messages(),
        vec![("a".to_owned(), b"1".to_vec()), ("c".to_owned(), b"3".to_vec())]
    );
}
