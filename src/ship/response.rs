use thiserror::Error;
use tracing::{debug, error, warn};

use super::Document;

/// Errors produced while scanning a bulk response body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("expected object")]
    ExpectedDict,
    #[error("expected array")]
    ExpectedArray,
    #[error("expected field name")]
    ExpectedFieldName,
    #[error("expected integer")]
    ExpectedInt,
    #[error("no 'items' field in response")]
    MissingItems,
    #[error("expected item response object")]
    ExpectedItemObject,
    #[error("expected item status code")]
    ExpectedStatusCode,
    #[error("empty object")]
    EmptyObject,
    #[error("expected end of object")]
    ExpectedObjectEnd,
    #[error("unexpected end of input")]
    Eof,
    #[error("unexpected character {0:?}")]
    Unexpected(char),
}

/// Structural token produced by [`JsonReader::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    DictStart,
    DictEnd,
    ArrayStart,
    ArrayEnd,
    Scalar,
}

/// Pull-based JSON reader over a raw byte buffer.
///
/// The reader never materializes a tree: values are consumed token by token
/// and unknown content is skipped by value. [`JsonReader::ignore_next`]
/// returns the raw bytes of the skipped value so callers can capture
/// sub-documents (the bulk `error` payload) without decoding them.
pub struct JsonReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> JsonReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Skips whitespace and the `,` / `:` separators between tokens.
    fn skip_separators(&mut self) {
        while let Some(&b) = self.buf.get(self.pos) {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' | b',' | b':' => self.pos += 1,
                _ => break,
            }
        }
    }

    fn peek(&mut self) -> Result<u8, ScanError> {
        self.skip_separators();
        self.buf.get(self.pos).copied().ok_or(ScanError::Eof)
    }

    /// Consumes an object opening brace.
    pub fn expect_dict(&mut self) -> Result<(), ScanError> {
        if self.peek()? != b'{' {
            return Err(ScanError::ExpectedDict);
        }
        self.pos += 1;
        Ok(())
    }

    /// Consumes an array opening bracket.
    pub fn expect_array(&mut self) -> Result<(), ScanError> {
        if self.peek()? != b'[' {
            return Err(ScanError::ExpectedArray);
        }
        self.pos += 1;
        Ok(())
    }

    /// Inside an object: returns the next field name, or `None` when the
    /// closing brace is reached (the brace is consumed).
    pub fn next_field_name(&mut self) -> Result<Option<&'a [u8]>, ScanError> {
        match self.peek()? {
            b'}' => {
                self.pos += 1;
                Ok(None)
            }
            b'"' => {
                let name = self.read_string()?;
                Ok(Some(name))
            }
            _ => Err(ScanError::ExpectedFieldName),
        }
    }

    /// Consumes an integer value.
    pub fn next_int(&mut self) -> Result<i64, ScanError> {
        let b = self.peek()?;
        if b != b'-' && !b.is_ascii_digit() {
            return Err(ScanError::ExpectedInt);
        }

        let start = self.pos;
        if b == b'-' {
            self.pos += 1;
        }
        while self.buf.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }

        // A fraction or exponent means this is not an integer.
        if matches!(self.buf.get(self.pos), Some(b'.') | Some(b'e') | Some(b'E')) {
            return Err(ScanError::ExpectedInt);
        }

        let text = std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|_| ScanError::ExpectedInt)?;
        text.parse().map_err(|_| ScanError::ExpectedInt)
    }

    /// Skips the next value of any kind and returns its raw bytes.
    pub fn ignore_next(&mut self) -> Result<&'a [u8], ScanError> {
        self.skip_separators();
        let start = self.pos;
        self.skip_value()?;
        Ok(&self.buf[start..self.pos])
    }

    /// Advances over one structural token. Container openings and closings
    /// are consumed as single tokens; scalars are consumed whole.
    pub fn step(&mut self) -> Result<Token, ScanError> {
        match self.peek()? {
            b'{' => {
                self.pos += 1;
                Ok(Token::DictStart)
            }
            b'}' => {
                self.pos += 1;
                Ok(Token::DictEnd)
            }
            b'[' => {
                self.pos += 1;
                Ok(Token::ArrayStart)
            }
            b']' => {
                self.pos += 1;
                Ok(Token::ArrayEnd)
            }
            _ => {
                self.skip_value()?;
                Ok(Token::Scalar)
            }
        }
    }

    /// Reads a string value, returning the bytes between the quotes.
    /// Escape sequences are skipped, not decoded; field names compared here
    /// are plain ASCII.
    fn read_string(&mut self) -> Result<&'a [u8], ScanError> {
        if self.peek()? != b'"' {
            return Err(ScanError::ExpectedFieldName);
        }
        self.pos += 1;
        let start = self.pos;

        while let Some(&b) = self.buf.get(self.pos) {
            match b {
                b'\\' => self.pos += 2,
                b'"' => {
                    let s = &self.buf[start..self.pos];
                    self.pos += 1;
                    return Ok(s);
                }
                _ => self.pos += 1,
            }
        }

        Err(ScanError::Eof)
    }

    /// Consumes one complete value: object, array, string, number, or
    /// keyword. Container contents are walked string-aware so braces inside
    /// strings do not confuse the depth count.
    fn skip_value(&mut self) -> Result<(), ScanError> {
        match self.peek()? {
            b'{' => self.skip_container(b'{', b'}'),
            b'[' => self.skip_container(b'[', b']'),
            b'"' => self.read_string().map(|_| ()),
            b'-' | b'0'..=b'9' => {
                while self
                    .buf
                    .get(self.pos)
                    .is_some_and(|&b| b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E'))
                {
                    self.pos += 1;
                }
                Ok(())
            }
            b't' | b'f' | b'n' => {
                while self.buf.get(self.pos).is_some_and(u8::is_ascii_alphabetic) {
                    self.pos += 1;
                }
                Ok(())
            }
            other => Err(ScanError::Unexpected(other as char)),
        }
    }

    fn skip_container(&mut self, open: u8, close: u8) -> Result<(), ScanError> {
        self.pos += 1;
        let mut depth = 1usize;

        while depth > 0 {
            match self.buf.get(self.pos).copied().ok_or(ScanError::Eof)? {
                b'"' => {
                    self.read_string()?;
                    continue;
                }
                b if b == open => depth += 1,
                b if b == close => depth -= 1,
                _ => {}
            }
            self.pos += 1;
        }

        Ok(())
    }
}

/// Scans a bulk response and returns the in-order subset of `sent` whose
/// items received transient statuses (429 or 5xx) and deserve a retry.
///
/// The subset is produced by compacting `sent` in place, so the returned
/// vector reuses the input's backing storage. A malformed response yields an
/// empty subset: with no per-item outcome available, nothing is retried.
pub fn collect_failures(body: &[u8], mut sent: Vec<Document>) -> Vec<Document> {
    let mut reader = JsonReader::new(body);
    match scan_items(&mut reader, &mut sent) {
        Ok(()) => sent,
        Err(e) => {
            error!(error = %e, "failed to parse bulk response");
            Vec::new()
        }
    }
}

fn scan_items(reader: &mut JsonReader<'_>, sent: &mut Vec<Document>) -> Result<(), ScanError> {
    reader.expect_dict()?;

    // Find the 'items' field, skipping everything else by value.
    loop {
        match reader.next_field_name()? {
            None => return Err(ScanError::MissingItems),
            Some(b"items") => break,
            Some(_) => {
                reader.ignore_next()?;
            }
        }
    }

    reader.expect_array()?;

    let count = sent.len();
    let mut kept = 0;
    for i in 0..count {
        let (status, raw_error) = item_status(reader)?;

        if status < 300 {
            continue; // acked
        }

        if status != 429 && status < 500 {
            // Permanent per-item failure: the document itself cannot be
            // indexed, retrying would fail the same way.
            warn!(
                status,
                error = %String::from_utf8_lossy(raw_error),
                "cannot index event, dropping",
            );
            continue;
        }

        debug!(item = i, status, "bulk item insert failed, will retry");
        sent.swap(kept, i);
        kept += 1;
    }

    sent.truncate(kept);
    Ok(())
}

/// Parses one element of the items array: a single-entry object keyed by
/// the action verb, wrapping the item status object.
fn item_status<'a>(reader: &mut JsonReader<'a>) -> Result<(i64, &'a [u8]), ScanError> {
    reader.expect_dict().map_err(|_| ScanError::ExpectedItemObject)?;

    // The one field is the action verb (e.g. "index", "create").
    match reader.next_field_name()? {
        None => return Err(ScanError::EmptyObject),
        Some(_) => {}
    }

    let (status, raw_error) = item_status_inner(reader)?;

    // The outer object must hold exactly one entry.
    if reader.step()? != Token::DictEnd {
        return Err(ScanError::ExpectedObjectEnd);
    }

    Ok((status, raw_error))
}

fn item_status_inner<'a>(reader: &mut JsonReader<'a>) -> Result<(i64, &'a [u8]), ScanError> {
    reader.expect_dict().map_err(|_| ScanError::ExpectedItemObject)?;

    let mut status: Option<i64> = None;
    let mut raw_error: &[u8] = b"";

    while let Some(name) = reader.next_field_name()? {
        match name {
            b"status" => status = Some(reader.next_int()?),
            b"error" => raw_error = reader.ignore_next()?,
            _ => {
                reader.ignore_next()?;
            }
        }
    }

    status
        .map(|s| (s, raw_error))
        .ok_or(ScanError::ExpectedStatusCode)
}
