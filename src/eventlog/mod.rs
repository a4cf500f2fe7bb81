pub mod journal;
pub mod plain;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tracing::debug;

use crate::config::EventLogConfig;
use crate::ship::Document;

use self::journal::JournalSource;
use self::plain::PlainTextSource;

/// One record read from an event-log source.
///
/// Record numbers are monotone within a source and serve as the read
/// cursor; `time_generated` feeds the ignore-older filter and the
/// date-suffixed index name.
#[derive(Debug, Clone)]
pub struct Record {
    pub source_name: String,
    pub record_number: u64,
    pub time_generated: DateTime<Utc>,
    /// Backend-specific payload fields (message, level, provider, ...).
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    /// Renders the record into an indexable document. The payload fields
    /// come first; the pipeline-required `@timestamp` and `type` fields and
    /// the cursor metadata are set on top.
    pub fn to_document(&self) -> Document {
        let mut doc = self.fields.clone();
        doc.insert(
            "@timestamp".to_string(),
            json!(self
                .time_generated
                .to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        doc.entry("type".to_string())
            .or_insert_with(|| json!("eventlog"));
        doc.insert("source_name".to_string(), json!(self.source_name));
        doc.insert("record_number".to_string(), json!(self.record_number));
        doc
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record {} from {} at {}",
            self.record_number, self.source_name, self.time_generated,
        )
    }
}

/// Capability consumed by ingest workers. Implementations read forward
/// through a single named source; `open` positions the stream just past
/// the given record number (zero means from the beginning).
pub trait EventSource: Send {
    fn name(&self) -> &str;
    fn open(&mut self, record_number: u64) -> Result<()>;
    fn read(&mut self) -> Result<Vec<Record>>;
    fn close(&mut self) -> Result<()>;
}

/// Event-log backend selected once at startup: the journal directory is
/// probed first, the plain-text directory as a fallback.
#[derive(Debug, Clone)]
pub enum Backend {
    Journal(PathBuf),
    Plain(PathBuf),
}

impl Backend {
    /// One-shot availability probe over the configured backends.
    pub fn probe(cfg: &EventLogConfig) -> Result<Backend> {
        let journal_dir = Path::new(&cfg.journal_dir);
        match journal::is_available(journal_dir) {
            Ok(true) => {
                debug!(dir = %journal_dir.display(), "using journal event log backend");
                return Ok(Backend::Journal(journal_dir.to_path_buf()));
            }
            Ok(false) => debug!(dir = %journal_dir.display(), "journal backend not available"),
            Err(e) => debug!(error = %e, "journal backend not available"),
        }

        let plain_dir = Path::new(&cfg.plain_dir);
        match plain::is_available(plain_dir) {
            Ok(true) => {
                debug!(dir = %plain_dir.display(), "using plain-text event log backend");
                return Ok(Backend::Plain(plain_dir.to_path_buf()));
            }
            Ok(false) => debug!(dir = %plain_dir.display(), "plain-text backend not available"),
            Err(e) => debug!(error = %e, "plain-text backend not available"),
        }

        bail!("no event log backend is available")
    }

    /// Creates a source for one named log.
    pub fn create(&self, name: &str, batch_size: usize) -> Box<dyn EventSource> {
        match self {
            Backend::Journal(dir) => Box::new(JournalSource::new(dir, name, batch_size)),
            Backend::Plain(dir) => Box::new(PlainTextSource::new(dir, name, batch_size)),
        }
    }
}

/// Directory probe shared by both backends: absent directories are simply
/// unavailable; anything else (permissions, IO) is an error worth logging.
fn dir_available(dir: &Path) -> Result<bool> {
    match std::fs::metadata(dir) {
        Ok(meta) => Ok(meta.is_dir()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
