use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::OutputConfig;
use crate::export::ShipperMetrics;

use super::bulk::{self, BulkRequest};
use super::response;
use super::{Document, ShipError};

/// A batch publish that did not fully succeed.
///
/// `retry` holds the events still owed to the index service, in input
/// order, reusing the submitted batch's storage. For connection-level
/// failures that is the whole accepted batch; for `TempBulkFailure` it is
/// the transient-status subset.
#[derive(Debug)]
pub struct PublishFailure {
    pub retry: Vec<Document>,
    pub error: ShipError,
}

/// Bulk client for an Elasticsearch-compatible index service.
///
/// The HTTP transport is shared between clones and safe for concurrent
/// use. The `connected` flag is advisory only: a stale value costs at most
/// one failed request or one skipped batch, never correctness.
pub struct Client {
    base_url: String,
    index: String,
    username: String,
    password: String,
    compression: Compression,
    http: reqwest::Client,
    connected: AtomicBool,
    metrics: Option<Arc<ShipperMetrics>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
}

impl Client {
    /// Builds a client from output configuration. The transport honors the
    /// TLS settings and the explicit forward proxy; with no proxy
    /// configured, ambient environment proxies apply.
    pub fn new(cfg: &OutputConfig, metrics: Option<Arc<ShipperMetrics>>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(cfg.timeout);

        if cfg.tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        if !cfg.tls.ca_file.is_empty() {
            let pem = std::fs::read(&cfg.tls.ca_file)
                .with_context(|| format!("reading CA file {}", cfg.tls.ca_file))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("parsing CA file {}", cfg.tls.ca_file))?;
            builder = builder.add_root_certificate(cert);
        }

        if !cfg.proxy_url.is_empty() {
            let proxy = reqwest::Proxy::all(&cfg.proxy_url)
                .with_context(|| format!("parsing proxy URL {}", cfg.proxy_url))?;
            builder = builder.proxy(proxy);
        }

        let http = builder.build().context("building HTTP client")?;

        let compression = match cfg.compression.as_str() {
            "gzip" => Compression::Gzip,
            _ => Compression::None,
        };

        Ok(Self {
            base_url: cfg.url.trim_end_matches('/').to_string(),
            index: cfg.index.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            compression,
            http,
            connected: AtomicBool::new(false),
            metrics,
        })
    }

    /// Returns a new logical sender sharing this client's transport, with
    /// its own (cleared) connection state.
    pub fn clone_sender(&self) -> Client {
        Client {
            base_url: self.base_url.clone(),
            index: self.index.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            compression: self.compression,
            http: self.http.clone(),
            connected: AtomicBool::new(false),
            metrics: self.metrics.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Marks the client disconnected.
    pub fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Issues a timed HEAD to the base URL. Reachable iff status < 300.
    pub async fn ping(&self, timeout: Duration) -> Result<bool, ShipError> {
        debug!(url = %self.base_url, ?timeout, "ping");

        let mut request = self.http.head(&self.base_url).timeout(timeout);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request.send().await.map_err(|e| {
            self.connected.store(false, Ordering::Relaxed);
            ShipError::Http(e)
        })?;

        let status = response.status().as_u16();
        debug!(status, "ping status");
        Ok(status < 300)
    }

    /// Pings the endpoint and records the outcome in the connection flag.
    /// A reached-but-unhealthy endpoint yields `NotConnected`.
    pub async fn connect(&self, timeout: Duration) -> Result<(), ShipError> {
        let reachable = self.ping(timeout).await?;
        self.connected.store(reachable, Ordering::Relaxed);
        if reachable {
            Ok(())
        } else {
            Err(ShipError::NotConnected)
        }
    }

    /// Publishes a batch through the bulk endpoint.
    ///
    /// The batch is consumed; on failure the events still owed come back in
    /// `PublishFailure::retry`. Unencodable documents are dropped up front,
    /// and per-item permanent failures are dropped during response
    /// classification; neither reappears in the retry set.
    pub async fn publish_events(&self, events: Vec<Document>) -> Result<(), PublishFailure> {
        if let Some(m) = &self.metrics {
            m.publish_calls.inc();
        }

        if !self.is_connected() {
            return Err(PublishFailure {
                retry: events,
                error: ShipError::NotConnected,
            });
        }

        let mut request = BulkRequest::with_capacity(events.len() * 256);
        let events = bulk::encode_batch(&mut request, &self.index, events);
        if events.is_empty() {
            return Ok(());
        }

        let response = match self.send_bulk(request.into_body()).await {
            Ok(response) => response,
            Err(error) => {
                self.connected.store(false, Ordering::Relaxed);
                return Err(PublishFailure {
                    retry: events,
                    error,
                });
            }
        };

        let status = response.status().as_u16();
        if status >= 300 {
            self.connected.store(false, Ordering::Relaxed);
            return Err(PublishFailure {
                retry: events,
                error: ShipError::Status(status),
            });
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                return Err(PublishFailure {
                    retry: events,
                    error: ShipError::Http(e),
                });
            }
        };

        let accepted = events.len();
        let retry = response::collect_failures(&body, events);

        if let Some(m) = &self.metrics {
            m.acked_events.inc_by((accepted - retry.len()) as f64);
            m.not_acked_events.inc_by(retry.len() as f64);
        }

        if retry.is_empty() {
            Ok(())
        } else {
            Err(PublishFailure {
                retry,
                error: ShipError::TempBulkFailure,
            })
        }
    }

    /// Publishes a single document. Transient outcomes (transport errors,
    /// 429, 5xx) surface as errors so the caller retries; permanent ones
    /// (other non-2xx, unencodable bodies) are swallowed after a warning.
    pub async fn publish_event(&self, doc: &Document) -> Result<(), ShipError> {
        if !self.is_connected() {
            return Err(ShipError::NotConnected);
        }

        match self.index_doc(doc).await {
            Ok(status) if status == 429 || status >= 500 => Err(ShipError::Status(status)),
            Ok(status) if status >= 300 => {
                // The service will never accept this document.
                warn!(status, "cannot index event, dropping");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(ShipError::JsonEncodeFailed) => {
                // Unencodable values would fail the same way on retry.
                warn!("failed to encode event, dropping");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to insert a single event");
                Err(e)
            }
        }
    }

    /// Sends one document to its date-derived index. Returns the HTTP
    /// status; encoding problems surface as `JsonEncodeFailed`.
    async fn index_doc(&self, doc: &Document) -> Result<u16, ShipError> {
        let timestamp = bulk::doc_timestamp(doc).ok_or(ShipError::JsonEncodeFailed)?;
        let doc_type = bulk::doc_type(doc).ok_or(ShipError::JsonEncodeFailed)?;
        let body = serde_json::to_vec(doc).map_err(|_| ShipError::JsonEncodeFailed)?;

        let index = bulk::index_name(&self.index, timestamp);
        let url = format!("{}/{}/{}", self.base_url, index, doc_type);

        let mut request = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                return Err(ShipError::Http(e));
            }
        };

        let status = response.status().as_u16();
        if status >= 300 {
            self.connected.store(false, Ordering::Relaxed);
        }
        Ok(status)
    }

    async fn send_bulk(&self, body: Vec<u8>) -> Result<reqwest::Response, ShipError> {
        let url = format!("{}/_bulk", self.base_url);

        let mut request = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson");

        request = match self.compression {
            Compression::None => request.body(body),
            Compression::Gzip => request
                .header(reqwest::header::CONTENT_ENCODING, "gzip")
                .body(gzip(&body)?),
        };

        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        Ok(request.send().await?)
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::write::GzEncoder;

    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
