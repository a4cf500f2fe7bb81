use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;

use super::{EventSource, Record};

/// Whether the plain-text log directory exists.
pub fn is_available(dir: &Path) -> Result<bool> {
    super::dir_available(dir)
}

/// Fallback source over plain-text log files. Each line is
/// `<RFC3339 timestamp> <message>`; the 1-based line number serves as the
/// record number. Lines without a parsable timestamp are skipped but still
/// counted, so record numbers stay stable across runs.
pub struct PlainTextSource {
    name: String,
    path: PathBuf,
    batch_size: usize,
    reader: Option<BufReader<File>>,
    offset: u64,
    line_no: u64,
}

impl PlainTextSource {
    pub fn new(dir: &Path, name: &str, batch_size: usize) -> Self {
        Self {
            name: name.to_string(),
            path: dir.join(format!("{name}.log")),
            batch_size,
            reader: None,
            offset: 0,
            line_no: 0,
        }
    }
}

impl EventSource for PlainTextSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, record_number: u64) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("opening log {}", self.path.display()))?;
        let mut reader = BufReader::new(file);

        // Count past the lines already shipped.
        self.offset = 0;
        self.line_no = 0;
        let mut line = String::new();
        while self.line_no < record_number {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .with_context(|| format!("seeking log {}", self.path.display()))?;
            if n == 0 || !line.ends_with('\n') {
                break;
            }
            self.offset += n as u64;
            self.line_no += 1;
        }

        reader
            .seek(SeekFrom::Start(self.offset))
            .with_context(|| format!("seeking log {}", self.path.display()))?;
        self.reader = Some(reader);
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<Record>> {
        let reader = self.reader.as_mut().context("log source is not open")?;

        let mut records = Vec::new();
        let mut line = String::new();

        while records.len() < self.batch_size {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .with_context(|| format!("reading log {}", self.path.display()))?;
            if n == 0 {
                break;
            }
            if !line.ends_with('\n') {
                reader
                    .seek(SeekFrom::Start(self.offset))
                    .with_context(|| format!("seeking log {}", self.path.display()))?;
                break;
            }

            self.offset += n as u64;
            self.line_no += 1;

            let Some(record) = parse_line(&self.name, self.line_no, line.trim_end()) else {
                warn!(
                    source = %self.name,
                    line = self.line_no,
                    "skipping line without a parsable timestamp",
                );
                continue;
            };
            records.push(record);
        }

        Ok(records)
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

fn parse_line(source: &str, line_no: u64, line: &str) -> Option<Record> {
    let (stamp, message) = line.split_once(' ')?;
    let time_generated = DateTime::parse_from_rfc3339(stamp)
        .ok()?
        .with_timezone(&Utc);

    let mut fields = serde_json::Map::new();
    fields.insert("message".to_string(), json!(message));

    Some(Record {
        source_name: source.to_string(),
        record_number: line_no,
        time_generated,
        fields,
    })
}
