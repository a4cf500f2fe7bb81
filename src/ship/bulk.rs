use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use super::Document;

/// Why a single document could not be added to a bulk request.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("document has no valid @timestamp field")]
    MissingTimestamp,
    #[error("document has no valid type field")]
    MissingDocType,
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Action header preceding each document in the bulk body.
#[derive(Serialize)]
struct ActionMeta<'a> {
    index: ActionIndex<'a>,
}

#[derive(Serialize)]
struct ActionIndex<'a> {
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_type")]
    doc_type: &'a str,
}

/// Accumulates newline-delimited action/document pairs for one bulk call.
pub struct BulkRequest {
    buf: Vec<u8>,
}

impl BulkRequest {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the request, yielding the encoded body.
    pub fn into_body(self) -> Vec<u8> {
        self.buf
    }

    /// Appends one action header and document. On failure the buffer is
    /// rolled back to its previous length, leaving no partial record.
    fn push(&mut self, doc: &Document, default_index: &str) -> Result<(), EncodeError> {
        let mark = self.buf.len();
        match self.try_push(doc, default_index) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.buf.truncate(mark);
                Err(e)
            }
        }
    }

    fn try_push(&mut self, doc: &Document, default_index: &str) -> Result<(), EncodeError> {
        let timestamp = doc_timestamp(doc).ok_or(EncodeError::MissingTimestamp)?;
        let doc_type = doc_type(doc).ok_or(EncodeError::MissingDocType)?;

        let meta = ActionMeta {
            index: ActionIndex {
                index: index_name(default_index, timestamp),
                doc_type,
            },
        };

        serde_json::to_writer(&mut self.buf, &meta)?;
        self.buf.push(b'\n');
        serde_json::to_writer(&mut self.buf, doc)?;
        self.buf.push(b'\n');
        Ok(())
    }
}

/// Encodes a batch into `request`, dropping documents that fail to encode.
///
/// Returns the accepted documents in input order, compacted in place so the
/// result reuses the input vector's storage; the caller later shrinks it to
/// the retry subset without reallocating.
pub fn encode_batch(
    request: &mut BulkRequest,
    default_index: &str,
    mut events: Vec<Document>,
) -> Vec<Document> {
    let mut kept = 0;
    for i in 0..events.len() {
        match request.push(&events[i], default_index) {
            Ok(()) => {
                events.swap(kept, i);
                kept += 1;
            }
            Err(e) => {
                // Dropped for good: an unencodable document will never
                // succeed on retry.
                error!(error = %e, "failed to encode event, dropping");
            }
        }
    }
    events.truncate(kept);
    events
}

/// Derives the effective index name from the document's UTC date,
/// e.g. `logs-2026.08.02`.
pub fn index_name(default_index: &str, timestamp: DateTime<Utc>) -> String {
    format!("{}-{}", default_index, timestamp.format("%Y.%m.%d"))
}

/// Extracts `@timestamp` as a UTC timestamp.
pub fn doc_timestamp(doc: &Document) -> Option<DateTime<Utc>> {
    let raw = doc.get("@timestamp")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Extracts the `type` field used as the doc kind.
pub fn doc_type(doc: &Document) -> Option<&str> {
    let t = doc.get("type")?.as_str()?;
    if t.is_empty() {
        None
    } else {
        Some(t)
    }
}
