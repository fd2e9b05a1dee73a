use crate::RuntimeError;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Receives the output of one unit's external commands, line by line.
pub trait LogSink: Send + Sync {
    fn line(&self, line: &str);

    /// Push buffered lines to durable storage.
    fn flush(&self) -> Result<(), RuntimeError>;

    /// Where a reader can find this log (a path for file sinks).
    fn reference(&self) -> Option<String>;
}

/// Hands out one sink per unit of a run.
pub trait LogSinkFactory: Send + Sync {
    fn open(&self, unit: &str) -> Result<Arc<dyn LogSink>, RuntimeError>;
}

pub struct FileLogSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileLogSink {
    pub fn create(path: &Path) -> Result<Self, RuntimeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileLogSink {
    fn line(&self, line: &str) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(writer, "{line}") {
            warn!(path = %self.path.display(), error = %e, "failed to write log line");
        }
    }

    fn flush(&self) -> Result<(), RuntimeError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn reference(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }
}

impl Drop for FileLogSink {
    fn drop(&mut self) {
        let writer = self.writer.get_mut().unwrap_or_else(PoisonError::into_inner);
        let _ = writer.flush();
    }
}

/// `{log_dir}/{run_id}/{unit}.log`
pub struct LogDir {
    dir: PathBuf,
}

impl LogDir {
    pub fn new(log_dir: &Path, run_id: &str) -> Self {
        Self {
            dir: log_dir.join(run_id),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl LogSinkFactory for LogDir {
    fn open(&self, unit: &str) -> Result<Arc<dyn LogSink>, RuntimeError> {
        let sink = FileLogSink::create(&self.dir.join(format!("{unit}.log")))?;
        Ok(Arc::new(sink))
    }
}

#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
    flushed: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of lines that were present at the last flush.
    pub fn flushed(&self) -> usize {
        *self.flushed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LogSink for MemorySink {
    fn line(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_owned());
    }

    fn flush(&self) -> Result<(), RuntimeError> {
        let count = self.lines.lock().unwrap_or_else(PoisonError::into_inner).len();
        *self.flushed.lock().unwrap_or_else(PoisonError::into_inner) = count;
        Ok(())
    }

    fn reference(&self) -> Option<String> {
        None
    }
}

/// In-memory sinks keyed by unit, for tests.
#[derive(Default)]
pub struct MemoryLogs {
    sinks: Mutex<BTreeMap<String, Arc<MemorySink>>>,
}

impl MemoryLogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, unit: &str) -> Option<Arc<MemorySink>> {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(unit)
            .cloned()
    }
}

impl LogSinkFactory for MemoryLogs {
    fn open(&self, unit: &str) -> Result<Arc<dyn LogSink>, RuntimeError> {
        let sink = self
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(unit.to_owned())
            .or_default()
            .clone();
        Ok(sink)
    }
}
