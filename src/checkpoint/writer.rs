//! Writing checkpoints to storage.
//!
//! Architecture
//! ------------
//!
//! [`CheckpointWriter::write`] writes one payload: the history
//! objects first, then the latest pointers by in-storage copy. If any
//! step fails the write is abandoned as is; nothing is rolled back.
//! Because the pointers move last, a half-written checkpoint is never
//! found by recovery's fast path.
//!
//! [`CheckpointWriterHandle`] owns a single background task which
//! writes payloads in submission order, so pointers can only move
//! forward. Submitting never blocks the learner: when the queue is
//! full the payload is dropped and the events it covered are simply
//! not in any trackback.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{CheckpointPath, CheckpointPayload, LATEST_MODEL, LATEST_STATE};
use crate::errors::StorageError;
use crate::metrics::{label, TrainerMetrics};
use crate::storage::ObjectStore;
use crate::with_timer;

pub struct CheckpointWriter {
    store: Arc<dyn ObjectStore>,
}

impl CheckpointWriter {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    #[tracing::instrument(name = "CheckpointWriter.write", skip_all, fields(path = %payload.path))]
    pub async fn write(&self, payload: &CheckpointPayload) -> Result<(), StorageError> {
        self.store.ensure_container().await?;

        let trackback = payload.path.trackback();
        let state = payload.path.state();
        let model = payload.path.model();
        tokio::try_join!(
            self.store.put(&trackback, &payload.trackback),
            self.store.put(&state, &payload.state),
        )?;
        self.store.put(&model, &payload.model).await?;

        self.store.copy(&state, LATEST_STATE).await?;
        if payload.update_latest_model {
            self.store.copy(&model, LATEST_MODEL).await?;
        }
        Ok(())
    }
}

/// Queue of checkpoints being written in the background.
pub struct CheckpointWriterHandle {
    tx: mpsc::Sender<CheckpointPayload>,
    written: watch::Receiver<Option<CheckpointPath>>,
    task: JoinHandle<()>,
    metrics: Arc<TrainerMetrics>,
}

impl CheckpointWriterHandle {
    /// Start the writer task.
    ///
    /// At most `queue_depth` payloads wait to be written; each write
    /// is abandoned after `write_timeout`.
    pub fn spawn(
        writer: CheckpointWriter,
        queue_depth: usize,
        write_timeout: Duration,
        metrics: Arc<TrainerMetrics>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<CheckpointPayload>(queue_depth.max(1));
        let (written_tx, written) = watch::channel(None);

        let task_metrics = metrics.clone();
        let task = tokio::spawn(async move {
            let metrics = task_metrics;
            while let Some(payload) = rx.recv().await {
                let res = with_timer!(
                    metrics.checkpoint_write_duration,
                    [],
                    tokio::time::timeout(write_timeout, writer.write(&payload)).await
                );
                match res {
                    Ok(Ok(())) => {
                        tracing::info!(
                            "Wrote checkpoint {} of model {} with {} trackback events",
                            payload.path,
                            payload.model_id,
                            payload.trackback_count
                        );
                        metrics.checkpoints_written.add(1, &[]);
                        written_tx.send_replace(Some(payload.path));
                    }
                    Ok(Err(err)) => {
                        tracing::error!("Abandoned checkpoint {}: {err}", payload.path);
                        metrics.checkpoints_failed.add(1, &label("reason", "storage"));
                    }
                    Err(_elapsed) => {
                        tracing::error!(
                            "Abandoned checkpoint {}: write took longer than {write_timeout:?}",
                            payload.path
                        );
                        metrics.checkpoints_failed.add(1, &label("reason", "timeout"));
                    }
                }
            }
            tracing::debug!("Checkpoint writer stopped");
        });

        Self {
            tx,
            written,
            task,
            metrics,
        }
    }

    /// Queue a payload to be written. Never blocks.
    ///
    /// Returns if the payload was queued.
    pub fn submit(&self, payload: CheckpointPayload) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(payload)) => {
                tracing::warn!(
                    "Checkpoint write queue full; dropping checkpoint {}",
                    payload.path
                );
                self.metrics.checkpoints_dropped.add(1, &[]);
                false
            }
            Err(mpsc::error::TrySendError::Closed(payload)) => {
                tracing::error!(
                    "Checkpoint writer is gone; dropping checkpoint {}",
                    payload.path
                );
                self.metrics.checkpoints_dropped.add(1, &[]);
                false
            }
        }
    }

    /// Path of the last checkpoint which was completely written.
    pub fn written(&self) -> watch::Receiver<Option<CheckpointPath>> {
        self.written.clone()
    }

    pub fn last_written(&self) -> Option<CheckpointPath> {
        *self.written.borrow()
    }

    /// Write everything queued so far, then stop.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(err) = self.task.await {
            tracing::error!("Checkpoint writer task failed: {err}");
        }
    }
}

#[cfg(test)]
fn payload(path: &str, update_latest_model: bool) -> CheckpointPayload {
    let path = CheckpointPath::parse(path).unwrap();
    CheckpointPayload {
        path,
        model_id: format!("model-{path}"),
        state: format!("state {path}").into_bytes(),
        model: format!("model {path}").into_bytes(),
        trackback: b"modelid: x\ne1\n".to_vec(),
        trackback_count: 1,
        update_latest_model,
    }
}

#[tokio::test]
async fn write_updates_pointers() {
    use crate::storage::InMemStore;

    let store = Arc::new(InMemStore::new());
    let writer = CheckpointWriter::new(store.clone());
    writer
        .write(&payload("20240101/000000", true))
        .await
        .unwrap();

    assert_eq!(
        store.get("20240101/000000/model.trackback").await.unwrap(),
        Some(b"modelid: x\ne1\n".to_vec())
    );
    assert_eq!(
        store.get(LATEST_STATE).await.unwrap(),
        Some(b"state 20240101/000000".to_vec())
    );
    assert_eq!(
        store.get(LATEST_MODEL).await.unwrap(),
        Some(b"model 20240101/000000".to_vec())
    );

    writer
        .write(&payload("20240101/000001", false))
        .await
        .unwrap();
    assert_eq!(
        store.get(LATEST_STATE).await.unwrap(),
        Some(b"state 20240101/000001".to_vec())
    );
    assert_eq!(
        store.get(LATEST_MODEL).await.unwrap(),
        Some(b"model 20240101/000000".to_vec())
    );
}

#[tokio::test]
async fn failed_model_upload_keeps_pointers() {
    use crate::storage::InMemStore;

    let store = Arc::new(InMemStore::new());
    let writer = CheckpointWriter::new(store.clone());
    writer
        .write(&payload("20240101/000000", true))
        .await
        .unwrap();

    store.fail_puts_ending_with(Some("/model"));
    assert!(writer
        .write(&payload("20240101/000001", true))
        .await
        .is_err());

    assert_eq!(
        store.get(LATEST_STATE).await.unwrap(),
        Some(b"state 20240101/000000".to_vec())
    );
    assert_eq!(
        store.get(LATEST_MODEL).await.unwrap(),
        Some(b"model 20240101/000000".to_vec())
    );
    // The partial directory stays; recovery will skip it.
    assert_eq!(store.get("20240101/000001/model").await.unwrap(), None);
    assert!(store.get("20240101/000001/state").await.unwrap().is_some());
}

#[tokio::test]
async fn handle_writes_in_order() {
    use crate::storage::InMemStore;

    let store = Arc::new(InMemStore::new());
    let handle = CheckpointWriterHandle::spawn(
        CheckpointWriter::new(store.clone()),
        4,
        Duration::from_secs(5),
        Arc::new(TrainerMetrics::detached()),
    );
    assert!(handle.submit(payload("20240101/000000", true)));
    assert!(handle.submit(payload("20240101/000001", true)));
    let written = handle.written();
    handle.close().await;

    assert_eq!(
        *written.borrow(),
        CheckpointPath::parse("20240101/000001")
    );
    assert_eq!(
        store.get(LATEST_STATE).await.unwrap(),
        Some(b"state 20240101/000001".to_vec())
    );
}

#[tokio::test]
async fn full_queue_drops() {
    use crate::storage::InMemStore;

    // A current-thread runtime doesn't run the writer task until we
    // yield, so the queue fills up.
    let store = Arc::new(InMemStore::new());
    let handle = CheckpointWriterHandle::spawn(
        CheckpointWriter::new(store.clone()),
        1,
        Duration::from_secs(5),
        Arc::new(TrainerMetrics::detached()),
    );
    assert!(handle.submit(payload("20240101/000000", true)));
    assert!(!handle.submit(payload("20240101/000001", true)));
    handle.close().await;

    assert_eq!(
        store.get(LATEST_STATE).await.unwrap(),
        Some(b"state 20240101/000000".to_vec())
    );
    assert_eq!(store.get("20240101/000001/state").await.unwrap(), None);
}
