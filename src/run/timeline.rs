//! Timeline sinks: where per-document progress events go besides the
//! document's own result.
//!
//! Ordering is guaranteed per document (events are emitted by the one task
//! that owns the document); delivery is best-effort.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc as tokio_mpsc;

use super::types::TimelineEvent;

#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("timeline channel closed")]
    Closed,
    #[error("timeline worker failed: {0}")]
    Join(String),
}

pub trait TimelineSink: Send + Sync {
    fn record(&self, event: &TimelineEvent) -> Result<(), TimelineError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTimelineSink;

impl TimelineSink for NoopTimelineSink {
    fn record(&self, _event: &TimelineEvent) -> Result<(), TimelineError> {
        Ok(())
    }
}

/// Appends one JSON line per event from a background writer thread.
#[derive(Clone)]
pub struct JsonlTimelineSink {
    sender: mpsc::Sender<TimelineEvent>,
}

pub struct TimelineWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TimelineError>>>,
}

impl TimelineWorker {
    /// Wait for the writer to drain. Drop every sink clone first.
    pub fn join(mut self) -> Result<(), TimelineError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TimelineError::Join("timeline worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlTimelineSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TimelineWorker), TimelineError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<TimelineEvent>();
        let handle = std::thread::spawn(move || write_timeline_loop(file, receiver));
        Ok((
            Self { sender },
            TimelineWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TimelineSink for JsonlTimelineSink {
    fn record(&self, event: &TimelineEvent) -> Result<(), TimelineError> {
        self.sender
            .send(event.clone())
            .map_err(|_| TimelineError::Closed)
    }
}

fn write_timeline_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<TimelineEvent>,
) -> Result<(), TimelineError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line =
            serde_json::to_string(&event).map_err(|e| TimelineError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Forwards events to an async consumer, e.g. a live progress view.
#[derive(Clone)]
pub struct ChannelTimelineSink {
    sender: tokio_mpsc::UnboundedSender<TimelineEvent>,
}

impl ChannelTimelineSink {
    pub fn new() -> (Self, tokio_mpsc::UnboundedReceiver<TimelineEvent>) {
        let (sender, receiver) = tokio_mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TimelineSink for ChannelTimelineSink {
    fn record(&self, event: &TimelineEvent) -> Result<(), TimelineError> {
        self.sender
            .send(event.clone())
            .map_err(|_| TimelineError::Closed)
    }
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
