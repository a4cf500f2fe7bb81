use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use logship::agent::Agent;
use logship::checkpoint::Checkpoint;
use logship::config::{CheckpointConfig, Config, EventLogConfig, OutputConfig, SourceConfig};
use logship::ship::{Client, Document, ShipError};

/// Loopback stand-in for the bulk endpoint. Answers HEAD on the base URL
/// and POST on /_bulk, recording every bulk body it receives. Canned item
/// statuses are consumed per call; with none queued every item gets 201.
#[derive(Clone, Default)]
struct StubState {
    bulk_bodies: Arc<Mutex<Vec<Vec<u8>>>>,
    canned_statuses: Arc<Mutex<VecDeque<Vec<u16>>>>,
}

impl StubState {
    fn bulk_calls(&self) -> usize {
        self.bulk_bodies.lock().expect("lock").len()
    }

    fn body(&self, i: usize) -> Vec<u8> {
        self.bulk_bodies.lock().expect("lock")[i].clone()
    }

    fn queue_statuses(&self, statuses: Vec<u16>) {
        self.canned_statuses
            .lock()
            .expect("lock")
            .push_back(statuses);
    }
}

async fn bulk_handler(State(state): State<StubState>, body: Bytes) -> String {
    let doc_count = body.split(|&b| b == b'\n').filter(|l| !l.is_empty()).count() / 2;
    state.bulk_bodies.lock().expect("lock").push(body.to_vec());

    let statuses = state
        .canned_statuses
        .lock()
        .expect("lock")
        .pop_front()
        .unwrap_or_else(|| vec![201; doc_count]);

    let items: Vec<String> = statuses
        .iter()
        .map(|s| format!(r#"{{"index":{{"_index":"logship","status":{s}}}}}"#))
        .collect();
    format!(r#"{{"took":1,"errors":false,"items":[{}]}}"#, items.join(","))
}

async fn start_stub() -> (String, StubState) {
    let state = StubState::default();

    let app = Router::new()
        .route("/", get(|| async { "" }))
        .route("/_bulk", post(bulk_handler))
        // Single-document inserts land on /{index}/{type}.
        .fallback(|| async { (axum::http::StatusCode::CREATED, "") })
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub server");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("stub server");
    });

    (format!("http://{addr}"), state)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met within timeout");
}

fn output_config(url: &str) -> OutputConfig {
    OutputConfig {
        url: url.to_string(),
        ..Default::default()
    }
}

fn doc(id: u64) -> Document {
    let mut d = Document::new();
    d.insert("@timestamp".into(), json!("2026-08-02T10:00:00Z"));
    d.insert("type".into(), json!("eventlog"));
    d.insert("id".into(), json!(id));
    d
}

#[tokio::test]
async fn ping_and_connect() {
    let (url, _state) = start_stub().await;
    let client = Client::new(&output_config(&url), None).expect("client");

    assert!(!client.is_connected());
    assert!(client
        .ping(Duration::from_secs(2))
        .await
        .expect("ping succeeds"));

    client
        .connect(Duration::from_secs(2))
        .await
        .expect("connect");
    assert!(client.is_connected());

    client.close();
    assert!(!client.is_connected());
}

#[tokio::test]
async fn ping_unreachable_endpoint_fails() {
    let client = Client::new(&output_config("http://127.0.0.1:1"), None).expect("client");
    let err = client
        .ping(Duration::from_secs(1))
        .await
        .expect_err("nothing listens on port 1");
    assert!(matches!(err, ShipError::Http(_)));
}

#[tokio::test]
async fn publish_fully_acked_batch() {
    let (url, state) = start_stub().await;
    let client = Client::new(&output_config(&url), None).expect("client");
    client
        .connect(Duration::from_secs(2))
        .await
        .expect("connect");

    client
        .publish_events(vec![doc(0), doc(1), doc(2)])
        .await
        .expect("all items acked");

    assert_eq!(state.bulk_calls(), 1);
    let body = state.body(0);
    let lines = body.split(|&b| b == b'\n').filter(|l| !l.is_empty()).count();
    assert_eq!(lines, 6); // three action/document pairs

    // Connection survives a clean bulk call.
    assert!(client.is_connected());
}

#[tokio::test]
async fn publish_returns_transient_failures_for_retry() {
    let (url, state) = start_stub().await;
    state.queue_statuses(vec![201, 429, 500]);

    let client = Client::new(&output_config(&url), None).expect("client");
    client
        .connect(Duration::from_secs(2))
        .await
        .expect("connect");

    let failure = client
        .publish_events(vec![doc(0), doc(1), doc(2)])
        .await
        .expect_err("two items must come back");

    assert!(matches!(failure.error, ShipError::TempBulkFailure));
    assert_eq!(failure.retry.len(), 2);
    assert_eq!(failure.retry[0]["id"], 1);
    assert_eq!(failure.retry[1]["id"], 2);

    // Resubmitting the subset drains it.
    client
        .publish_events(failure.retry)
        .await
        .expect("retry acked");
    assert_eq!(state.bulk_calls(), 2);
}

#[tokio::test]
async fn publish_drops_permanent_failures() {
    let (url, state) = start_stub().await;
    state.queue_statuses(vec![400, 201]);

    let client = Client::new(&output_config(&url), None).expect("client");
    client
        .connect(Duration::from_secs(2))
        .await
        .expect("connect");

    // The mapping rejection is logged and dropped; the call reports success.
    client
        .publish_events(vec![doc(0), doc(1)])
        .await
        .expect("permanent failures are not retried");
}

#[tokio::test]
async fn publish_single_event() {
    let (url, _state) = start_stub().await;
    let client = Client::new(&output_config(&url), None).expect("client");
    client
        .connect(Duration::from_secs(2))
        .await
        .expect("connect");

    client.publish_event(&doc(0)).await.expect("single insert");
    assert!(client.is_connected());
}

fn write_journal_records(dir: &std::path::Path, name: &str, records: &[(u64, &str)]) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{name}.ndjson")))
        .expect("open journal");
    for (number, message) in records {
        writeln!(
            file,
            r#"{{"record_number":{number},"time_generated":"2026-08-02T10:00:0{number}Z","message":"{message}"}}"#
        )
        .expect("write journal");
    }
}

fn agent_config(url: &str, journal_dir: &std::path::Path, state_path: &std::path::Path) -> Config {
    Config {
        sources: vec![SourceConfig {
            name: "application".to_string(),
            ignore_older: Duration::ZERO,
            batch_size: 100,
        }],
        eventlog: EventLogConfig {
            journal_dir: journal_dir.display().to_string(),
            plain_dir: "/nonexistent/logship-plain".to_string(),
        },
        output: output_config(url),
        checkpoint: CheckpointConfig {
            path: state_path.display().to_string(),
            max_unwritten: 1,
            flush_interval: Duration::from_millis(100),
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn agent_ships_and_checkpoints_end_to_end() {
    let (url, state) = start_stub().await;
    let dir = tempfile::TempDir::new().expect("tempdir");
    let state_path = dir.path().join("state");

    write_journal_records(
        dir.path(),
        "application",
        &[(1, "first"), (2, "second"), (3, "third")],
    );

    let cfg = agent_config(&url, dir.path(), &state_path);
    cfg.validate().expect("valid config");

    let mut agent = Agent::new(cfg).expect("agent");
    agent.start().await.expect("start");

    wait_until(|| state.bulk_calls() >= 1).await;
    agent.stop().await.expect("stop");

    // One bulk call with all three documents.
    let body = state.body(0);
    let text = String::from_utf8(body).expect("utf8 body");
    assert!(text.contains("first"));
    assert!(text.contains("third"));

    // The cursor is durable at the last read record.
    let checkpoint =
        Checkpoint::new(&state_path, 10, Duration::from_secs(5)).expect("reload checkpoint");
    assert_eq!(checkpoint.states()["application"].record_number, 3);
}

#[tokio::test]
async fn agent_filters_old_records_but_advances_cursor() {
    let (url, state) = start_stub().await;
    let dir = tempfile::TempDir::new().expect("tempdir");
    let state_path = dir.path().join("state");

    let now = chrono::Utc::now();
    let stale = (now - chrono::Duration::hours(100)).to_rfc3339();
    let fresh = (now - chrono::Duration::minutes(1)).to_rfc3339();

    let lines: Vec<String> = [
        (1, &stale, "stale-a"),
        (2, &stale, "stale-b"),
        (3, &fresh, "fresh-a"),
        (4, &fresh, "fresh-b"),
    ]
    .iter()
    .map(|(number, ts, message)| {
        format!(
            r#"{{"record_number":{number},"time_generated":"{ts}","message":"{message}"}}"#
        )
    })
    .collect();

    let mut file = std::fs::File::create(dir.path().join("application.ndjson")).expect("journal");
    for line in &lines {
        writeln!(file, "{line}").expect("write journal");
    }

    let mut cfg = agent_config(&url, dir.path(), &state_path);
    cfg.sources[0].ignore_older = Duration::from_secs(72 * 3600);

    let mut agent = Agent::new(cfg).expect("agent");
    agent.start().await.expect("start");
    wait_until(|| state.bulk_calls() >= 1).await;
    agent.stop().await.expect("stop");

    // Only the fresh records ship.
    let text = String::from_utf8(state.body(0)).expect("utf8 body");
    assert!(text.contains("fresh-a"));
    assert!(text.contains("fresh-b"));
    assert!(!text.contains("stale-a"));

    // The cursor still covers the filtered records: they are read, not
    // published, and must not be read again.
    let checkpoint =
        Checkpoint::new(&state_path, 10, Duration::from_secs(5)).expect("reload checkpoint");
    assert_eq!(checkpoint.states()["application"].record_number, 4);
}

#[tokio::test]
async fn agent_resumes_from_checkpoint_after_restart() {
    let (url, state) = start_stub().await;
    let dir = tempfile::TempDir::new().expect("tempdir");
    let state_path = dir.path().join("state");

    write_journal_records(dir.path(), "application", &[(1, "old-a"), (2, "old-b")]);

    // First run ships the initial records and persists the cursor.
    let mut agent = Agent::new(agent_config(&url, dir.path(), &state_path)).expect("agent");
    agent.start().await.expect("start");
    wait_until(|| state.bulk_calls() >= 1).await;
    agent.stop().await.expect("stop");

    // New records arrive while the agent is down.
    write_journal_records(dir.path(), "application", &[(3, "fresh-c")]);

    let mut agent = Agent::new(agent_config(&url, dir.path(), &state_path)).expect("agent");
    agent.start().await.expect("start");
    wait_until(|| state.bulk_calls() >= 2).await;
    agent.stop().await.expect("stop");

    // The second run ships only what the cursor had not covered.
    let text = String::from_utf8(state.body(1)).expect("utf8 body");
    assert!(text.contains("fresh-c"));
    assert!(!text.contains("old-a"));
    assert!(!text.contains("old-b"));

    let checkpoint =
        Checkpoint::new(&state_path, 10, Duration::from_secs(5)).expect("reload checkpoint");
    assert_eq!(checkpoint.states()["application"].record_number, 3);
}
