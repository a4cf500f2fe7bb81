pub mod bulk;
pub mod client;
pub mod response;

pub use client::{Client, PublishFailure};

use thiserror::Error;

/// A document ready for indexing: field name to arbitrary JSON value.
///
/// The pipeline requires `@timestamp` (RFC 3339, convertible to UTC) and
/// `type` (short identifier used as the doc kind in the target index).
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Errors surfaced by the shipping client. `NotConnected`,
/// `JsonEncodeFailed` and `TempBulkFailure` are sentinels callers match on.
#[derive(Debug, Error)]
pub enum ShipError {
    /// The client has not established (or has lost) its connection.
    #[error("client is not connected")]
    NotConnected,

    /// A document could not be encoded as JSON.
    #[error("JSON encoding failed")]
    JsonEncodeFailed,

    /// Some items in a bulk request received transient error statuses and
    /// should be resubmitted.
    #[error("temporary bulk send failure")]
    TempBulkFailure,

    /// The endpoint answered with a non-success HTTP status.
    #[error("bulk endpoint returned HTTP status {0}")]
    Status(u16),

    /// Transport-level failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Failure assembling the request body.
    #[error("building request body: {0}")]
    Io(#[from] std::io::Error),
}
