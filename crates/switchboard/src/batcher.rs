//! Progress batching.
//!
//! Optional wrapper around a [`ProgressReporter`] for handlers that emit
//! many fine-grained updates. Updates collect in an in-memory ring drained
//! by a single serial flusher task, so batched progress is also ordered.
//! A flush happens when the batch interval elapses, the batch fills, an
//! update crosses the flush threshold, or the batcher shuts down.
//!
//! When wrapping a reporter, configure it with a zero minimum interval:
//! the batch interval provides the pacing and the combining rule bounds
//! the frame count.

use crate::progress::ProgressReporter;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchconf::ProgressConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One buffered progress update.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percentage: u8,
    pub message: String,
    /// Set when the update describes a per-item failure; always flushed.
    pub error: Option<String>,
}

impl ProgressUpdate {
    pub fn new(percentage: u8, message: impl Into<String>) -> Self {
        Self {
            percentage,
            message: message.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct BatcherOptions {
    pub interval: Duration,
    pub max_batch: usize,
    pub flush_threshold: u8,
}

impl Default for BatcherOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            max_batch: 10,
            flush_threshold: 95,
        }
    }
}

impl From<&ProgressConfig> for BatcherOptions {
    fn from(config: &ProgressConfig) -> Self {
        Self {
            interval: config.interval_min(),
            max_batch: config.max_batch,
            flush_threshold: config.flush_threshold,
        }
    }
}

enum Command {
    Update(ProgressUpdate),
    Shutdown,
}

/// Serial batching flusher over a progress reporter.
pub struct ProgressBatcher {
    tx: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressBatcher {
    pub fn new(reporter: Arc<ProgressReporter>, options: BatcherOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(flusher(reporter, options, rx));
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Buffer an update. Never fatal; a shut-down batcher drops it.
    pub fn push(&self, update: ProgressUpdate) {
        let _ = self.tx.send(Command::Update(update));
    }

    /// Flush whatever is buffered and stop the flusher.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn flusher(
    reporter: Arc<ProgressReporter>,
    options: BatcherOptions,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut buffer: Vec<ProgressUpdate> = Vec::new();
    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Update(update)) => {
                    let crosses_threshold = update.percentage >= options.flush_threshold;
                    buffer.push(update);
                    if buffer.len() >= options.max_batch || crosses_threshold {
                        flush(&reporter, &mut buffer).await;
                    }
                }
                Some(Command::Shutdown) | None => {
                    flush(&reporter, &mut buffer).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                flush(&reporter, &mut buffer).await;
            }
        }
    }
}

async fn flush(reporter: &ProgressReporter, buffer: &mut Vec<ProgressUpdate>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    for update in combine_batch(&batch) {
        match &update.error {
            Some(error) => {
                reporter
                    .report(update.percentage, &format!("{} ({error})", update.message))
                    .await;
            }
            None => reporter.report(update.percentage, &update.message).await,
        }
    }
}

/// The combining rule: the first and last update always survive, plus any
/// update 10 or more points above the previously-included one, plus any
/// update carrying an error. Bounds the frame count while preserving
/// significant transitions.
pub fn combine_batch(batch: &[ProgressUpdate]) -> Vec<ProgressUpdate> {
    match batch {
        [] => Vec::new(),
        [only] => vec![only.clone()],
        [first, middle @ .., last] => {
            let mut selected = vec![first.clone()];
            let mut last_included = first.percentage;
            for update in middle {
                if update.error.is_some() || update.percentage >= last_included.saturating_add(10)
                {
                    last_included = update.percentage;
                    selected.push(update.clone());
                }
            }
            selected.push(last.clone());
            selected
        }
    }
}
