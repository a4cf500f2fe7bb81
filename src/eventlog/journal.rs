use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use super::{EventSource, Record};

/// Whether the journal directory exists.
pub fn is_available(dir: &Path) -> Result<bool> {
    super::dir_available(dir)
}

/// On-disk journal line. Every record carries its own number and
/// generation time; remaining fields pass through to the document.
#[derive(Debug, Deserialize)]
struct JournalRecord {
    record_number: u64,
    time_generated: DateTime<Utc>,
    #[serde(flatten)]
    fields: serde_json::Map<String, serde_json::Value>,
}

/// Reads NDJSON journal files, one record per line, appended by an
/// external collector. A partially written trailing line is left in the
/// file until its newline arrives.
pub struct JournalSource {
    name: String,
    path: PathBuf,
    batch_size: usize,
    reader: Option<BufReader<File>>,
    /// Byte offset of the first unread line.
    offset: u64,
    /// Highest record number delivered or skipped so far.
    cursor: u64,
}

impl JournalSource {
    pub fn new(dir: &Path, name: &str, batch_size: usize) -> Self {
        Self {
            name: name.to_string(),
            path: dir.join(format!("{name}.ndjson")),
            batch_size,
            reader: None,
            offset: 0,
            cursor: 0,
        }
    }
}

impl EventSource for JournalSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, record_number: u64) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("opening journal {}", self.path.display()))?;
        self.reader = Some(BufReader::new(file));
        self.offset = 0;
        self.cursor = record_number;
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<Record>> {
        let reader = self
            .reader
            .as_mut()
            .context("journal source is not open")?;

        let mut records = Vec::new();
        let mut line = String::new();

        while records.len() < self.batch_size {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .with_context(|| format!("reading journal {}", self.path.display()))?;
            if n == 0 {
                break;
            }

            if !line.ends_with('\n') {
                // The writer has not finished this line; rewind and pick it
                // up on a later poll.
                reader
                    .seek(SeekFrom::Start(self.offset))
                    .with_context(|| format!("seeking journal {}", self.path.display()))?;
                break;
            }
            self.offset += n as u64;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let raw: JournalRecord = match serde_json::from_str(trimmed) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(source = %self.name, error = %e, "skipping malformed journal line");
                    continue;
                }
            };

            // Lines at or below the cursor were shipped in an earlier run.
            if raw.record_number <= self.cursor {
                continue;
            }

            self.cursor = raw.record_number;
            records.push(Record {
                source_name: self.name.clone(),
                record_number: raw.record_number,
                time_generated: raw.time_generated,
                fields: raw.fields,
            });
        }

        Ok(records)
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}
