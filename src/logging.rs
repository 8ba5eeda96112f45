//! Request journal: a bounded in-memory history of bridge activity, mirrored
//! to a JSONL file so it survives restarts.
//!
//! Console diagnostics go through `tracing`; the journal records one line per
//! notable step of each request (inbound, translate, upstream, stream) and is
//! served back on `GET /journal`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Entries kept in memory (and, after compaction, on disk).
pub const DEFAULT_JOURNAL_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Which part of the bridge produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Startup,
    Inbound,
    Translate,
    Upstream,
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub stage: Stage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl JournalEntry {
    pub fn new(level: LogLevel, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            stage,
            message: message.into(),
            context: None,
        }
    }
}

/// The last `capacity` entries, mirrored to an append-only JSONL file.
///
/// The file is rewritten to hold exactly the in-memory entries when it is
/// opened with stale or unreadable lines, and whenever it grows to twice the
/// capacity. It therefore never holds more than `2 * capacity` lines.
pub struct Journal {
    path: PathBuf,
    capacity: usize,
    entries: VecDeque<JournalEntry>,
    writer: BufWriter<File>,
    file_lines: usize,
}

impl Journal {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Self::with_capacity(path, DEFAULT_JOURNAL_CAPACITY)
    }

    /// Open (or create) the journal file and replay its tail into memory.
    pub fn with_capacity(path: impl AsRef<Path>, capacity: usize) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let capacity = capacity.max(1);

        if let Some(parent) = parent_dir(&path) {
            fs::create_dir_all(parent)?;
        }

        let (entries, lines_read) = replay(&path, capacity)?;
        if lines_read > entries.len() {
            tracing::debug!(
                path = %path.display(),
                kept = entries.len(),
                dropped = lines_read - entries.len(),
                "compacting journal"
            );
            rewrite(&path, &entries)?;
        }

        Ok(Self {
            writer: append_writer(&path)?,
            file_lines: entries.len(),
            path,
            capacity,
            entries,
        })
    }

    pub fn record(&mut self, entry: JournalEntry) {
        match append_line(&mut self.writer, &entry) {
            Ok(()) => self.file_lines += 1,
            Err(e) => tracing::warn!(error = %e, "failed to append journal entry"),
        }

        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);

        if self.file_lines >= self.capacity * 2 {
            if let Err(e) = self.compact() {
                tracing::warn!(error = %e, "journal compaction failed");
            }
        }
    }

    /// Rewrite the file so it holds only the retained entries.
    pub fn compact(&mut self) -> std::io::Result<()> {
        self.writer.flush()?;
        rewrite(&self.path, &self.entries)?;
        self.writer = append_writer(&self.path)?;
        self.file_lines = self.entries.len();
        Ok(())
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<JournalEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Lines currently in the backing file.
    pub fn file_lines(&self) -> usize {
        self.file_lines
    }
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

fn append_writer(path: &Path) -> std::io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn append_line(writer: &mut BufWriter<File>, entry: &JournalEntry) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, entry)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Read every line of `path`, keeping the newest `capacity` valid entries.
/// Returns the entries and the number of lines seen.
fn replay(path: &Path, capacity: usize) -> std::io::Result<(VecDeque<JournalEntry>, usize)> {
    let mut entries = VecDeque::new();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((entries, 0)),
        Err(e) => return Err(e),
    };

    let mut lines_read = 0;
    for line in BufReader::new(file).split(b'\n') {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        lines_read += 1;
        if let Ok(entry) = serde_json::from_slice::<JournalEntry>(&line) {
            if entries.len() >= capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }
    Ok((entries, lines_read))
}

/// Replace `path` with the given entries via a sibling temp file and rename.
fn rewrite<'a>(
    path: &Path,
    entries: impl IntoIterator<Item = &'a JournalEntry>,
) -> std::io::Result<()> {
    let dir = parent_dir(path).unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        for entry in entries {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Cloneable handle shared by the router and every in-flight stream.
#[derive(Clone)]
pub struct SharedJournal(Arc<Mutex<Journal>>);

impl SharedJournal {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Journal::open(path).map(Self::from)
    }

    pub fn record(&self, entry: JournalEntry) {
        if let Ok(mut journal) = self.0.lock() {
            journal.record(entry);
        }
    }

    pub fn note(&self, level: LogLevel, stage: Stage, message: impl Into<String>) {
        self.record(JournalEntry::new(level, stage, message));
    }

    pub fn info(&self, stage: Stage, message: impl Into<String>) {
        self.note(LogLevel::Info, stage, message);
    }

    pub fn warn(&self, stage: Stage, message: impl Into<String>) {
        self.note(LogLevel::Warn, stage, message);
    }

    pub fn error(&self, stage: Stage, message: impl Into<String>) {
        self.note(LogLevel::Error, stage, message);
    }

    pub fn debug(&self, stage: Stage, message: impl Into<String>) {
        self.note(LogLevel::Debug, stage, message);
    }

    /// Record an entry carrying structured fields (model, param, ...).
    pub fn record_with_context(
        &self,
        level: LogLevel,
        stage: Stage,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        let mut entry = JournalEntry::new(level, stage, message);
        entry.context = Some(context);
        self.record(entry);
    }

    pub fn recent(&self, limit: usize) -> Vec<JournalEntry> {
        self.0.lock().map(|j| j.recent(limit)).unwrap_or_default()
    }
}

impl From<Journal> for SharedJournal {
    fn from(journal: Journal) -> Self {
        Self(Arc::new(Mutex::new(journal)))
    }
}
