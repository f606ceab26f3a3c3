//! Coalesce a fast stream of values into at most one processed value
//! per window.
//!
//! Architecture
//! ------------
//!
//! The producer overwrites a single slot and wakes the worker task.
//! The worker waits for a first value, sleeps the window out, then
//! processes whatever is in the slot at that moment. Values pushed
//! while the worker sleeps or processes are coalesced: only the newest
//! one survives to the next window close.
//!
//! Pushing never blocks. A poisoned slot drops the value with a warning.
//! Processing errors are logged and don't stop the worker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

/// What to do with each value that survives a window.
#[async_trait]
pub trait Process<T>: Send + 'static {
    async fn process(&mut self, value: T) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

struct Slot<T> {
    latest: Mutex<Option<T>>,
    pushed: Notify,
}

impl<T> Slot<T> {
    fn take(&self) -> Option<T> {
        self.latest.lock().ok().and_then(|mut latest| latest.take())
    }
}

pub struct RateLimitedPipeline<T> {
    name: &'static str,
    slot: Arc<Slot<T>>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl<T> RateLimitedPipeline<T>
where
    T: Send + 'static,
{
    pub fn spawn<P>(name: &'static str, window: Duration, processor: P) -> Self
    where
        P: Process<T>,
    {
        let slot = Arc::new(Slot {
            latest: Mutex::new(None),
            pushed: Notify::new(),
        });
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(name, slot.clone(), window, processor, shutdown_rx));
        Self {
            name,
            slot,
            shutdown,
            task,
        }
    }

    /// Offer the newest value. Replaces any value not processed yet.
    pub fn push(&self, value: T) {
        match self.slot.latest.lock() {
            Ok(mut latest) => *latest = Some(value),
            Err(_) => {
                tracing::warn!("{} slot lock is poisoned; dropping value", self.name);
                return;
            }
        }
        self.slot.pushed.notify_one();
    }

    /// Process any pending value right away, then stop.
    pub async fn close(self) {
        // The worker might already be gone.
        let _ = self.shutdown.send(());
        if let Err(err) = self.task.await {
            tracing::error!("{} worker task failed: {err}", self.name);
        }
    }
}

async fn process<T, P: Process<T>>(name: &str, processor: &mut P, value: T) {
    if let Err(err) = processor.process(value).await {
        tracing::warn!("{name} failed to process value: {err}");
    }
}

async fn run<T, P>(
    name: &'static str,
    slot: Arc<Slot<T>>,
    window: Duration,
    mut processor: P,
    mut shutdown: oneshot::Receiver<()>,
) where
    T: Send + 'static,
    P: Process<T>,
{
    loop {
        tokio::select! {
            _ = slot.pushed.notified() => {}
            _ = &mut shutdown => break,
        }
        tokio::select! {
            _ = tokio::time::sleep(window) => {}
            _ = &mut shutdown => break,
        }
        // Might be empty if a wakeup came from a value we already
        // processed.
        if let Some(value) = slot.take() {
            process(name, &mut processor, value).await;
        }
    }

    if let Some(value) = slot.take() {
        process(name, &mut processor, value).await;
    }
    tracing::debug!("{name} stopped");
}

#[cfg(test)]
#[derive(Clone, Default)]
struct Collect(Arc<Mutex<Vec<(tokio::time::Instant, u32)>>>);

#[cfg(test)]
impl Collect {
    fn values(&self) -> Vec<u32> {
        self.0.lock().unwrap().iter().map(|(_, v)| *v).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Process<u32> for Collect {
    async fn process(&mut self, value: u32) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.0.lock().unwrap().push((tokio::time::Instant::now(), value));
        if value == 13 {
            return Err("unlucky".into());
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn coalesces_to_latest() {
    let collect = Collect::default();
    let pipeline = RateLimitedPipeline::spawn("test", Duration::from_secs(1), collect.clone());
    for i in 0..100 {
        pipeline.push(i);
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(collect.values(), vec![99]);

    // Nothing pushed; nothing processed.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(collect.values(), vec![99]);
    pipeline.close().await;
    assert_eq!(collect.values(), vec![99]);
}

#[tokio::test(start_paused = true)]
async fn at_most_once_per_window() {
    let collect = Collect::default();
    let pipeline = RateLimitedPipeline::spawn("test", Duration::from_secs(1), collect.clone());
    for i in 0..50 {
        pipeline.push(i);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    pipeline.close().await;

    let processed = collect.0.lock().unwrap().clone();
    assert!(processed.len() <= 6, "{processed:?}");
    for pair in processed.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= Duration::from_secs(1), "{processed:?}");
        assert!(pair[1].1 > pair[0].1);
    }
    assert_eq!(processed.last().map(|(_, v)| *v), Some(49));
}

#[tokio::test(start_paused = true)]
async fn failures_dont_stop_processing() {
    let collect = Collect::default();
    let pipeline = RateLimitedPipeline::spawn("test", Duration::from_secs(1), collect.clone());
    pipeline.push(13);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    pipeline.push(14);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(collect.values(), vec![13, 14]);
    pipeline.close().await;
}

#[tokio::test(start_paused = true)]
async fn close_flushes_pending() {
    let collect = Collect::default();
    let pipeline = RateLimitedPipeline::spawn("test", Duration::from_secs(60), collect.clone());
    pipeline.push(7);
    tokio::task::yield_now().await;
    pipeline.close().await;
    assert_eq!(collect.values(), vec![7]);
}

#[tokio::test(start_paused = true)]
async fn poisoned_slot_drops_without_panicking() {
    let collect = Collect::default();
    let pipeline = RateLimitedPipeline::spawn("test", Duration::from_secs(1), collect.clone());
    let slot = pipeline.slot.clone();
    let poisoner = std::thread::spawn(move || {
        let _latest = slot.latest.lock().unwrap();
        panic!("poison the slot");
    });
    assert!(poisoner.join().is_err());
    assert!(pipeline.slot.latest.is_poisoned());

    pipeline.push(1);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    pipeline.close().await;
    assert!(collect.values().is_empty());
}
