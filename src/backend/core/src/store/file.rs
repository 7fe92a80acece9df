//! JSON-lines event log.
//!
//! Each line of the log file is one serialized [`RecordedEvent`]. The whole
//! file is indexed in memory on open; appends are written and flushed before
//! they become visible to readers.
//!
//! File I/O runs on the blocking pool. An append that has started always runs
//! to completion there, even if the calling future is dropped, so the file and
//! the index never disagree.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use super::{AppendAck, EventLog, ExpectedVersion, LogIndex, StoreError};
use crate::events::{ConfigEvent, RecordedEvent, StreamId};

/// Configuration for the file-based event log.
#[derive(Debug, Clone)]
pub struct FileEventLogConfig {
    /// Path of the JSON-lines log file
    pub path: PathBuf,

    /// Whether to fsync after each append (default: true).
    ///
    /// When `false` appends are only flushed to the OS page cache.
    pub sync_on_append: bool,

    /// Live feed buffer per subscriber
    pub feed_capacity: usize,
}

impl FileEventLogConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_on_append: true,
            feed_capacity: 1024,
        }
    }
}

/// File-backed event log.
pub struct FileEventLog {
    shared: Arc<Shared>,
}

struct Shared {
    config: FileEventLogConfig,
    index: RwLock<LogIndex>,
    /// Held from validation to index insert, serialising appends.
    writer: Mutex<File>,
    feed: broadcast::Sender<RecordedEvent>,
    /// Set when a failed write could not be rolled back. The file may then
    /// hold a record the index does not, so appends stay refused until reopen.
    wedged: AtomicBool,
    #[cfg(test)]
    fail_next_sync: AtomicBool,
}

impl FileEventLog {
    /// Open (or create) the log at `config.path` and index its contents.
    pub fn open(config: FileEventLogConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| io_unavailable(&config.path, e))?;
            }
        }

        let index = load_index(&config.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .map_err(|e| io_unavailable(&config.path, e))?;

        info!(
            path = %config.path.display(),
            events = index.len(),
            "File event log opened"
        );

        let (feed, _) = broadcast::channel(config.feed_capacity.max(1));
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                index: RwLock::new(index),
                writer: Mutex::new(file),
                feed,
                wedged: AtomicBool::new(false),
                #[cfg(test)]
                fail_next_sync: AtomicBool::new(false),
            }),
        })
    }

    /// Open with default settings.
    pub fn open_path(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open(FileEventLogConfig::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.shared.config.path
    }
}

impl Shared {
    /// Validate, write, and index one append. Runs on the blocking pool.
    fn commit(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ConfigEvent>,
    ) -> Result<(Vec<RecordedEvent>, u64), StoreError> {
        let mut file = self.writer.lock();
        if self.wedged.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "{}: a failed append could not be rolled back; reopen the log",
                self.config.path.display()
            )));
        }

        let records = self.index.read().prepare(stream, expected, events)?;
        if !records.is_empty() {
            self.write_records(&mut file, &records)?;
        }

        let mut index = self.index.write();
        index.insert(&records);
        for record in &records {
            let _ = self.feed.send(record.clone());
        }
        Ok((records, index.stream_version(stream)))
    }

    /// Write `records` and make them durable, or leave the file as it was.
    fn write_records(&self, file: &mut File, records: &[RecordedEvent]) -> Result<(), StoreError> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)
                .map_err(|e| StoreError::Unavailable(format!("failed to encode event: {}", e)))?;
            buf.push(b'\n');
        }

        let path = &self.config.path;
        let start = file.metadata().map_err(|e| io_unavailable(path, e))?.len();
        let written = file
            .write_all(&buf)
            .and_then(|()| file.flush())
            .and_then(|()| self.sync(file));

        if let Err(e) = written {
            match file.set_len(start) {
                Ok(()) => warn!(path = %path.display(), error = %e, "Append failed; file rolled back"),
                Err(rollback) => {
                    self.wedged.store(true, Ordering::SeqCst);
                    error!(
                        path = %path.display(),
                        error = %e,
                        rollback_error = %rollback,
                        "Append failed and could not be rolled back"
                    );
                }
            }
            return Err(io_unavailable(path, e));
        }
        Ok(())
    }

    fn sync(&self, file: &File) -> std::io::Result<()> {
        #[cfg(test)]
        if self.fail_next_sync.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected sync failure"));
        }
        if self.config.sync_on_append {
            file.sync_data()
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EventLog for FileEventLog {
    #[instrument(skip(self, events), fields(stream = %stream, expected = %expected))]
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ConfigEvent>,
    ) -> Result<AppendAck, StoreError> {
        let shared = Arc::clone(&self.shared);
        let stream = stream.clone();
        let (records, next_version) =
            tokio::task::spawn_blocking(move || shared.commit(&stream, expected, events))
                .await
                .map_err(|e| StoreError::Unavailable(format!("append task failed: {}", e)))??;

        debug!(next_version, count = records.len(), "Events appended");
        Ok(AppendAck { next_version, records })
    }

    async fn read_forward(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, StoreError> {
        self.shared.index.read().read_stream(stream)
    }

    async fn read_all_forward(&self) -> Result<Vec<RecordedEvent>, StoreError> {
        Ok(self.shared.index.read().read_all())
    }

    fn subscribe_all(&self) -> Option<broadcast::Receiver<RecordedEvent>> {
        Some(self.shared.feed.subscribe())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Read and validate every line of the log.
///
/// A final line without a trailing newline is a torn write from a crash; it is
/// dropped and the file truncated back to the last complete line. Any other
/// undecodable line, or a line whose positions break the log's ordering, is
/// reported as corruption.
fn load_index(path: &Path) -> Result<LogIndex, StoreError> {
    let mut index = LogIndex::default();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(e) => return Err(io_unavailable(path, e)),
    };

    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut valid_len: u64 = 0;
    let mut line_no = 0usize;

    loop {
        line.clear();
        let read = reader.read_line(&mut line).map_err(|e| io_unavailable(path, e))?;
        if read == 0 {
            break;
        }
        line_no += 1;

        if !line.ends_with('\n') {
            warn!(path = %path.display(), line = line_no, "Dropping torn trailing record");
            truncate(path, valid_len)?;
            break;
        }
        if line.trim().is_empty() {
            valid_len += read as u64;
            continue;
        }

        let record: RecordedEvent = serde_json::from_str(line.trim_end())
            .map_err(|e| StoreError::Corrupt(format!("line {}: {}", line_no, e)))?;

        let expected_stream_version = index.stream_version(&record.stream_id) + 1;
        let expected_position = index.len() as u64 + 1;
        if record.stream_version != expected_stream_version
            || record.global_position != expected_position
            || record.event.key() != record.stream_id.as_str()
        {
            return Err(StoreError::Corrupt(format!(
                "line {}: record {}@{} (global {}) out of sequence",
                line_no, record.stream_id, record.stream_version, record.global_position
            )));
        }

        index.insert(std::slice::from_ref(&record));
        valid_len += read as u64;
    }

    Ok(index)
}

fn truncate(path: &Path, len: u64) -> Result<(), StoreError> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_len(len))
        .map_err(|e| io_unavailable(path, e))
}

fn io_unavailable(path: &Path, error: std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {}", path.display(), error))
}
