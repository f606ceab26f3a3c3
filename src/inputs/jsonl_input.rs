use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use super::{EventSource, ResumeFilter};
use crate::errors::InputError;
use crate::event::{DecisionEvent, Offset, PartitionKey};
use crate::metrics::TrainerMetrics;

/// Reads one JSON [`DecisionEvent`] per line.
///
/// Blank lines are ignored. Lines which don't parse are logged,
/// counted, and skipped; only I/O errors end the stream.
pub struct JsonLinesInput {
    lines: Lines<Box<dyn AsyncBufRead + Unpin + Send>>,
    line: u64,
    resume: ResumeFilter,
    metrics: Arc<TrainerMetrics>,
}

impl JsonLinesInput {
    pub fn new(reader: Box<dyn AsyncBufRead + Unpin + Send>, metrics: Arc<TrainerMetrics>) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
            resume: ResumeFilter::default(),
            metrics,
        }
    }

    pub fn open(path: &Path, metrics: Arc<TrainerMetrics>) -> Result<Self, InputError> {
        let file = std::fs::File::open(path)?;
        let file = tokio::fs::File::from_std(file);
        Ok(Self::new(Box::new(BufReader::new(file)), metrics))
    }

    pub fn stdin(metrics: Arc<TrainerMetrics>) -> Self {
        Self::new(Box::new(BufReader::new(tokio::io::stdin())), metrics)
    }

    fn parse(&self, text: &str) -> Result<DecisionEvent, InputError> {
        serde_json::from_str(text).map_err(|source| InputError::Parse {
            line: self.line,
            source,
        })
    }
}

#[async_trait]
impl EventSource for JsonLinesInput {
    fn seek(&mut self, offsets: &BTreeMap<PartitionKey, Offset>) {
        self.resume.seek(offsets);
    }

    async fn next(&mut self) -> Result<Option<DecisionEvent>, InputError> {
        while let Some(text) = self.lines.next_line().await? {
            self.line += 1;
            if text.trim().is_empty() {
                continue;
            }
            match self.parse(&text) {
                Ok(event) if self.resume.skip(&event) => {
                    tracing::trace!("Skipping already learned event {}", event.event_id);
                    self.metrics.events_skipped.add(1, &[]);
                }
                Ok(event) => return Ok(Some(event)),
                Err(err) => {
                    tracing::warn!("{err}; skipping line");
                    self.metrics.input_parse_failures.add(1, &[]);
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
fn test_line(id: &str, offset: u64) -> String {
    let event = crate::learner::test_event(id, "0", offset);
    serde_json::to_string(&event).unwrap()
}

#[tokio::test]
async fn reads_lines() {
    let text = format!(
        "{}\n\nnot json\n{}\n",
        test_line("e1", 1),
        test_line("e2", 2)
    );
    let mut input = JsonLinesInput::new(
        Box::new(std::io::Cursor::new(text.into_bytes())),
        Arc::new(TrainerMetrics::detached()),
    );

    let first = input.next().await.unwrap().unwrap();
    assert_eq!(first.event_id, "e1");
    let second = input.next().await.unwrap().unwrap();
    assert_eq!(second.event_id, "e2");
    assert_eq!(input.line, 4);
    assert!(input.next().await.unwrap().is_none());
}

#[tokio::test]
async fn seek_skips_learned() {
    let text = format!(
        "{}\n{}\n{}\n",
        test_line("e1", 1),
        test_line("e2", 2),
        test_line("e3", 3)
    );
    let mut input = JsonLinesInput::new(
        Box::new(std::io::Cursor::new(text.into_bytes())),
        Arc::new(TrainerMetrics::detached()),
    );
    input.seek(&BTreeMap::from([(PartitionKey::from("0"), Offset(2))]));

    let event = input.next().await.unwrap().unwrap();
    assert_eq!(event.event_id, "e3");
    assert!(input.next().await.unwrap().is_none());
}

#[tokio::test]
async fn open_reads_file() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{}", test_line("e1", 1)).unwrap();
    let mut input = JsonLinesInput::open(file.path(), Arc::new(TrainerMetrics::detached())).unwrap();
    assert_eq!(input.next().await.unwrap().unwrap().event_id, "e1");
    assert!(input.next().await.unwrap().is_none());
}
