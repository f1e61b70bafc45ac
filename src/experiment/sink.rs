//! Result sinks: where scan records go.
//!
//! The engine hands every [`ScanRecord`] to a [`ResultSink`] as soon as all
//! reads for its set-point have finished, in set-point order. Persistence is
//! the collector's business; the sinks here cover tests, in-process
//! consumers and a plain JSON Lines file.

use super::state::ScanRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

/// Consumer of scan records.
#[async_trait]
pub trait ResultSink: Send {
    /// Take one record. An error is reported in the run report; the scan continues.
    async fn accept(&mut self, record: ScanRecord) -> Result<()>;

    /// Called once after the last record of a run.
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<ScanRecord>,
    flushed: bool,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records received so far, in arrival order.
    pub fn records(&self) -> &[ScanRecord] {
        &self.records
    }

    /// Take the records out of the sink.
    pub fn into_records(self) -> Vec<ScanRecord> {
        self.records
    }

    /// Whether `flush` was called.
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn accept(&mut self, record: ScanRecord) -> Result<()> {
        self.records.push(record);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flushed = true;
        Ok(())
    }
}

/// Forwards records over a tokio channel to an external collector.
///
/// Back-pressure from a bounded channel slows the scan down rather than
/// dropping records.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ScanRecord>,
}

impl ChannelSink {
    /// Create a sink and the receiving end, with room for `capacity` records.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ScanRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ResultSink for ChannelSink {
    async fn accept(&mut self, record: ScanRecord) -> Result<()> {
        self.tx
            .send(record)
            .await
            .map_err(|_| anyhow::anyhow!("Result collector dropped its receiver"))
    }
}

/// Writes one JSON object per record and line.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl JsonLinesSink {
    /// Create (or truncate) `path`, creating missing parent directories.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = File::create(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    /// Destination file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

impl std::fmt::Debug for JsonLinesSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesSink")
            .field("path", &self.path)
            .field("written", &self.written)
            .finish()
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn accept(&mut self, record: ScanRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record).context("Failed to serialize record")?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        self.written += 1;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .await
            .with_context(|| format!("Failed to flush {}", self.path.display()))
    }
}
