use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::{Config, SourceConfig};
use crate::eventlog::{Backend, EventSource, Record};
use crate::export::ShipperMetrics;
use crate::ship::{Client, Document, ShipError};

/// How long a worker sleeps after an empty read.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// First delay when draining a transient retry subset; doubles per attempt.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound for the retry backoff.
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Agent orchestrates the pipeline: checkpoint store, event-log backend,
/// shipping client, metrics endpoint, and one ingest worker per source.
pub struct Agent {
    cfg: Config,
    metrics: Arc<ShipperMetrics>,
    checkpoint: Option<Arc<Checkpoint>>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Creates a new Agent, initializing the metrics registry.
    pub fn new(cfg: Config) -> Result<Self> {
        let metrics =
            Arc::new(ShipperMetrics::new(&cfg.metrics.addr).context("creating metrics")?);

        Ok(Self {
            cfg,
            metrics,
            checkpoint: None,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
        })
    }

    /// Start all components and begin shipping.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Metrics endpoint, when configured.
        if self.metrics.has_endpoint() {
            self.metrics
                .start()
                .await
                .context("starting metrics server")?;
        }

        // 2. Checkpoint store; its snapshot seeds every worker's cursor.
        let checkpoint = Arc::new(
            Checkpoint::new(
                std::path::Path::new(&self.cfg.checkpoint.path),
                self.cfg.checkpoint.max_unwritten,
                self.cfg.checkpoint.flush_interval,
            )
            .context("opening checkpoint store")?,
        );
        let persisted = checkpoint.states();

        // 3. One-shot backend probe.
        let backend = Backend::probe(&self.cfg.eventlog).context("probing event log backend")?;

        // 4. Shipping client; workers get clones sharing the transport.
        let client =
            Client::new(&self.cfg.output, Some(Arc::clone(&self.metrics))).context("building shipping client")?;

        // 5. Spawn one worker per source.
        for source_cfg in &self.cfg.sources {
            debug!(source = %source_cfg.name, "initializing event log");

            let source = backend.create(&source_cfg.name, source_cfg.batch_size);
            let cursor = persisted
                .get(&source_cfg.name)
                .map(|s| s.record_number)
                .unwrap_or(0);

            let worker = SourceWorker {
                source,
                cfg: source_cfg.clone(),
                client: client.clone_sender(),
                checkpoint: Arc::clone(&checkpoint),
                metrics: Arc::clone(&self.metrics),
                ping_timeout: self.cfg.output.ping_timeout,
                cancel: self.cancel.clone(),
                cursor,
            };

            self.workers.push(tokio::spawn(worker.run()));
        }

        self.checkpoint = Some(checkpoint);

        info!(sources = self.cfg.sources.len(), "agent started");

        Ok(())
    }

    /// Gracefully stop: signal workers, await them, flush the checkpoint.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker join failed");
            }
        }

        if let Some(checkpoint) = &self.checkpoint {
            let checkpoint = Arc::clone(checkpoint);
            tokio::task::spawn_blocking(move || checkpoint.shutdown())
                .await
                .context("checkpoint shutdown")?;
        }

        self.metrics.stop();

        Ok(())
    }
}

/// Outcome of one batch delivery attempt, retries included.
enum Delivery {
    /// Every accepted item was acknowledged.
    Acked,
    /// Connection-level failure; the window must be re-read.
    Failed,
    /// Shutdown fired mid-delivery.
    Shutdown,
}

/// Per-source ingest worker: poll, filter, publish, persist.
struct SourceWorker {
    source: Box<dyn EventSource>,
    cfg: SourceConfig,
    client: Client,
    checkpoint: Arc<Checkpoint>,
    metrics: Arc<ShipperMetrics>,
    ping_timeout: Duration,
    cancel: CancellationToken,
    /// Last record number persisted (or loaded at startup).
    cursor: u64,
}

impl SourceWorker {
    async fn run(mut self) {
        let name = self.cfg.name.clone();

        if let Err(e) = self.source.open(self.cursor) {
            warn!(
                source = %name,
                error = %e,
                "open failed, no events will be read from this source",
            );
            return;
        }
        debug!(source = %name, cursor = self.cursor, "event log opened");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let records = match self.source.read() {
                Ok(records) => records,
                Err(e) => {
                    warn!(source = %name, error = %e, "read failed, stopping worker");
                    break;
                }
            };
            debug!(source = %name, count = records.len(), "read records");

            if records.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                continue;
            }

            // The cursor tracks read progress, not published progress:
            // filtered records must not be re-read on restart.
            let last = records.last().expect("records is non-empty");
            let (last_record, last_time) = (last.record_number, last.time_generated);

            let batch = self.filter_batch(&records);
            let submitted = batch.len() as u64;
            drop(records);

            if submitted > 0 {
                match self.deliver(batch).await {
                    Delivery::Acked => {
                        self.metrics.published_events.inc_by(submitted as f64);
                        self.metrics
                            .published_by_source
                            .with_label_values(&[&name])
                            .inc_by(submitted as f64);
                        info!(source = %name, count = submitted, "published events");
                    }
                    Delivery::Failed => {
                        self.metrics.publish_failures.inc();
                        warn!(source = %name, count = submitted, "failed to publish events");

                        // Rewind so the next iteration re-reads this window.
                        if let Err(e) = self.source.open(self.cursor) {
                            warn!(source = %name, error = %e, "rewind failed, stopping worker");
                            break;
                        }

                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        }
                        continue;
                    }
                    Delivery::Shutdown => break,
                }
            }

            self.record_progress(&name, last_record, last_time);
        }

        if let Err(e) = self.source.close() {
            warn!(source = %name, error = %e, "close failed");
        }
        debug!(source = %name, "worker stopped");
    }

    /// Applies the ignore-older pre-filter and renders documents.
    fn filter_batch(&self, records: &[Record]) -> Vec<Document> {
        let now = Utc::now();
        let mut batch = Vec::with_capacity(records.len());

        for record in records {
            if self.too_old(record, now) {
                debug!(source = %self.cfg.name, %record, "ignore_older filter dropping event");
                self.metrics.ignored_events.inc();
                self.metrics
                    .ignored_by_source
                    .with_label_values(&[&self.cfg.name])
                    .inc();
                continue;
            }
            batch.push(record.to_document());
        }

        batch
    }

    fn too_old(&self, record: &Record, now: DateTime<Utc>) -> bool {
        if self.cfg.ignore_older.is_zero() {
            return false;
        }
        now.signed_duration_since(record.time_generated)
            .to_std()
            .map(|age| age > self.cfg.ignore_older)
            .unwrap_or(false) // future-dated records are not old
    }

    /// Publishes a batch, reconnecting when needed and draining transient
    /// retry subsets before reporting success. The cursor only moves once
    /// the subset is empty.
    async fn deliver(&mut self, mut batch: Vec<Document>) -> Delivery {
        if !self.client.is_connected() {
            if let Err(e) = self.client.connect(self.ping_timeout).await {
                debug!(source = %self.cfg.name, error = %e, "connect failed");
                return Delivery::Failed;
            }
            info!(source = %self.cfg.name, "connected to index service");
        }

        let mut backoff = RETRY_BACKOFF;
        loop {
            match self.client.publish_events(batch).await {
                Ok(()) => return Delivery::Acked,
                Err(failure) => match failure.error {
                    ShipError::TempBulkFailure => {
                        debug!(
                            source = %self.cfg.name,
                            retry = failure.retry.len(),
                            "draining transient bulk failures",
                        );
                        batch = failure.retry;

                        tokio::select! {
                            _ = self.cancel.cancelled() => return Delivery::Shutdown,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                    }
                    error => {
                        debug!(source = %self.cfg.name, error = %error, "publish failed");
                        return Delivery::Failed;
                    }
                },
            }
        }
    }

    fn record_progress(&mut self, name: &str, record_number: u64, timestamp: DateTime<Utc>) {
        self.checkpoint.persist(name, record_number, timestamp);
        self.cursor = record_number;
    }
}
