//! Append-only event log, sharded by UTC date.
//!
//! One JSON object per line, `events-YYYY-MM-DD.jsonl` under the
//! configured directory. Events are buffered and flushed in batches off
//! the hot path (the recorder runs on the telemetry drain task).

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::events::TelemetryEvent;

/// Errors from the event recorder.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("event log io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("event serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Date-sharded JSONL event recorder.
pub struct EventRecorder {
    dir: PathBuf,
    buffer: Vec<TelemetryEvent>,
    buffer_size: usize,
    current: Option<(NaiveDate, BufWriter<File>)>,
}

impl EventRecorder {
    pub fn new(dir: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            dir: dir.into(),
            buffer: Vec::with_capacity(buffer_size.max(1)),
            buffer_size: buffer_size.max(1),
            current: None,
        }
    }

    /// Queue an event; flushes automatically when the buffer fills.
    pub fn record(&mut self, event: TelemetryEvent) -> Result<(), RecorderError> {
        self.buffer.push(event);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Write all buffered events to their date shards.
    pub fn flush(&mut self) -> Result<(), RecorderError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        for event in std::mem::take(&mut self.buffer) {
            let date = event.ts.date_naive();
            let writer = self.writer_for(date)?;
            serde_json::to_writer(&mut *writer, &event)?;
            writer.write_all(b"\n")?;
        }
        if let Some((_, writer)) = &mut self.current {
            writer.flush()?;
        }
        Ok(())
    }

    /// Path of the shard for a given date.
    pub fn shard_path(dir: &Path, date: NaiveDate) -> PathBuf {
        dir.join(format!("events-{}.jsonl", date.format("%Y-%m-%d")))
    }

    fn writer_for(&mut self, date: NaiveDate) -> Result<&mut BufWriter<File>, RecorderError> {
        let needs_rotate = match &self.current {
            Some((open_date, _)) => *open_date != date,
            None => true,
        };
        if needs_rotate {
            if let Some((_, mut writer)) = self.current.take() {
                writer.flush()?;
            }
            fs::create_dir_all(&self.dir)?;
            let path = Self::shard_path(&self.dir, date);
            debug!("event log shard: {}", path.display());
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.current = Some((date, BufWriter::new(file)));
        }
        Ok(&mut self.current.as_mut().expect("writer just installed").1)
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("event recorder flush on drop failed: {e}");
        }
    }
}

/// Drain the telemetry channel into the recorder until the channel
/// closes. Intended to be spawned as a housekeeping task.
pub async fn run_recorder(
    mut recorder: EventRecorder,
    mut rx: mpsc::Receiver<TelemetryEvent>,
) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = recorder.record(event) {
            warn!("event recorder write failed: {e}");
        }
    }
    if let Err(e) = recorder.flush() {
        warn!("event recorder final flush failed: {e}");
    }
}
