use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Read cursor for one source: the last record observed and when it was
/// generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogState {
    pub record_number: u64,
    pub timestamp: DateTime<Utc>,
}

struct Inner {
    states: HashMap<String, EventLogState>,
    unwritten: usize,
    last_flush: Instant,
}

/// Durable store for per-source read cursors.
///
/// Cursor updates land in memory immediately; the file write is coalesced
/// until either `max_unwritten` updates accumulate or `flush_interval` has
/// passed since the last write. The file is replaced atomically (temp file
/// in the same directory, fsync, rename), so a concurrent reader only ever
/// observes a complete previous or complete new state.
pub struct Checkpoint {
    path: PathBuf,
    max_unwritten: usize,
    flush_interval: Duration,
    inner: Mutex<Inner>,
    // Serializes snapshots and file writes so an older snapshot can never
    // overwrite a newer one.
    flush_lock: Mutex<()>,
}

impl Checkpoint {
    /// Opens the store, loading any existing checkpoint file. A relative
    /// path is resolved to an absolute one up front.
    pub fn new(path: &Path, max_unwritten: usize, flush_interval: Duration) -> Result<Self> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("resolving working directory")?
                .join(path)
        };

        let states = Self::load(&path)?;
        info!(path = %path.display(), sources = states.len(), "checkpoint loaded");

        Ok(Self {
            path,
            max_unwritten,
            flush_interval,
            inner: Mutex::new(Inner {
                states,
                unwritten: 0,
                last_flush: Instant::now(),
            }),
            flush_lock: Mutex::new(()),
        })
    }

    fn load(path: &Path) -> Result<HashMap<String, EventLogState>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let data = fs::read_to_string(path)
            .with_context(|| format!("reading checkpoint file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parsing checkpoint file {}", path.display()))
    }

    /// The checkpoint file location (absolute).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A copied snapshot of the current cursor map.
    pub fn states(&self) -> HashMap<String, EventLogState> {
        self.inner.lock().states.clone()
    }

    /// Records a new cursor for `source`, flushing to disk when the
    /// coalescing thresholds are met.
    pub fn persist(&self, source: &str, record_number: u64, timestamp: DateTime<Utc>) {
        let should_flush = {
            let mut inner = self.inner.lock();
            inner.states.insert(
                source.to_string(),
                EventLogState {
                    record_number,
                    timestamp,
                },
            );
            inner.unwritten += 1;

            inner.unwritten >= self.max_unwritten
                || inner.last_flush.elapsed() >= self.flush_interval
        };

        if should_flush {
            self.flush();
        }
    }

    /// Writes any pending state and returns once the file is durable.
    pub fn shutdown(&self) {
        self.flush();
        debug!(path = %self.path.display(), "checkpoint shut down");
    }

    fn flush(&self) {
        let _guard = self.flush_lock.lock();

        let (snapshot, pending) = {
            let inner = self.inner.lock();
            (inner.states.clone(), inner.unwritten)
        };

        match write_state(&self.path, &snapshot) {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.unwritten = inner.unwritten.saturating_sub(pending);
                inner.last_flush = Instant::now();
            }
            Err(e) => {
                // Dirty set stays; the next persist retries the write.
                warn!(
                    error = %e,
                    path = %self.path.display(),
                    "checkpoint flush failed",
                );
            }
        }
    }
}

/// Serializes the full map to a temporary file beside the target, fsyncs,
/// and renames it into place.
fn write_state(path: &Path, states: &HashMap<String, EventLogState>) -> Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".new");
    let tmp = PathBuf::from(tmp);

    let data = serde_json::to_vec_pretty(states).context("serializing checkpoint state")?;

    let mut file =
        File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    file.write_all(&data)
        .with_context(|| format!("writing {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing {}", tmp.display()))?;
    drop(file);

    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("timestamp")
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().expect("tempdir");
        let cp = Checkpoint::new(&dir.path().join("state"), 10, Duration::from_secs(5))
            .expect("checkpoint");
        assert!(cp.states().is_empty());
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state");

        {
            let cp = Checkpoint::new(&path, 10, Duration::from_secs(5)).expect("checkpoint");
            cp.persist("application", 42, ts(1_700_000_000));
            cp.persist("system", 7, ts(1_700_000_100));
            cp.shutdown();
        }

        let cp = Checkpoint::new(&path, 10, Duration::from_secs(5)).expect("checkpoint");
        let states = cp.states();
        assert_eq!(states.len(), 2);
        assert_eq!(states["application"].record_number, 42);
        assert_eq!(states["application"].timestamp, ts(1_700_000_000));
        assert_eq!(states["system"].record_number, 7);
    }

    #[test]
    fn test_shutdown_reflects_latest_persist() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state");

        {
            // Thresholds high enough that only shutdown flushes.
            let cp = Checkpoint::new(&path, 1000, Duration::from_secs(3600)).expect("checkpoint");
            cp.persist("application", 5, ts(100));
            cp.persist("application", 9, ts(200));
            cp.shutdown();
        }

        let cp = Checkpoint::new(&path, 10, Duration::from_secs(5)).expect("checkpoint");
        assert_eq!(cp.states()["application"].record_number, 9);
    }

    #[test]
    fn test_count_threshold_triggers_flush() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state");

        let cp = Checkpoint::new(&path, 3, Duration::from_secs(3600)).expect("checkpoint");
        cp.persist("application", 1, ts(1));
        cp.persist("application", 2, ts(2));
        assert!(!path.exists());

        cp.persist("application", 3, ts(3));
        assert!(path.exists());

        // Without shutdown, the on-disk state already holds the third cursor.
        let loaded = Checkpoint::new(&path, 10, Duration::from_secs(5)).expect("checkpoint");
        assert_eq!(loaded.states()["application"].record_number, 3);
    }

    #[test]
    fn test_file_is_always_complete() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state");

        let cp = Checkpoint::new(&path, 1, Duration::from_secs(5)).expect("checkpoint");
        for i in 1..=20u64 {
            cp.persist("application", i, ts(i as i64));
            // Every observation of the file parses as a complete map.
            let data = fs::read_to_string(&path).expect("read");
            let states: HashMap<String, EventLogState> =
                serde_json::from_str(&data).expect("complete state");
            assert_eq!(states["application"].record_number, i);
        }
    }

    #[test]
    fn test_states_returns_copy() {
        let dir = TempDir::new().expect("tempdir");
        let cp = Checkpoint::new(&dir.path().join("state"), 10, Duration::from_secs(5))
            .expect("checkpoint");
        cp.persist("application", 1, ts(1));

        let mut snapshot = cp.states();
        snapshot.insert(
            "bogus".to_string(),
            EventLogState {
                record_number: 99,
                timestamp: ts(0),
            },
        );

        assert!(!cp.states().contains_key("bogus"));
    }

    #[test]
    fn test_relative_path_resolved_absolute() {
        let cp = Checkpoint::new(Path::new("relative.state"), 1000, Duration::from_secs(3600))
            .expect("checkpoint");
        assert!(cp.path().is_absolute());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state");
        fs::write(&path, b"{not json").expect("write");

        let err = Checkpoint::new(&path, 10, Duration::from_secs(5))
            .err()
            .expect("corrupt file must not load silently");
        assert!(err.to_string().contains("parsing checkpoint file"));
    }
}
