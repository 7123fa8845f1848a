use base64::Engine as _;
use protofuzz::history::HistoryStore;
use protofuzz::session::store::SessionStore;
use protofuzz::session::{SessionConfig, SessionStatus};
use protofuzz::{PluginBundle, SessionManager, Settings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// SimpleTCP plugin bundle with embedded seeds and a state machine.
fn plugin_json() -> String {
    serde_json::json!({
        "name": "simple_tcp",
        "transport": "tcp",
        "data_model": {
            "name": "SimpleTCP",
            "blocks": [
                {"name": "magic", "type": "bytes", "size": 4,
                 "default": b64(b"STCP"), "mutable": false},
                {"name": "length", "type": "uint32", "endian": "big",
                 "is_size_field": true, "size_of": "payload", "mutable": false},
                {"name": "command", "type": "uint8",
                 "values": {"1": "AUTH", "2": "DATA", "3": "QUIT"}},
                {"name": "payload", "type": "bytes", "max_size": 256}
            ],
            "seeds": [
                b64(b"STCP\x00\x00\x00\x05\x01HELLO"),
                b64(b"STCP\x00\x00\x00\x04\x02TEST"),
                b64(b"STCP\x00\x00\x00\x00\x03")
            ]
        },
        "state_model": {
            "initial_state": "INIT",
            "states": ["INIT", "READY", "CLOSED"],
            "transitions": [
                {"from": "INIT", "to": "READY", "message_type": "AUTH"},
                {"from": "READY", "to": "READY", "message_type": "DATA"},
                {"from": "READY", "to": "CLOSED", "message_type": "QUIT"}
            ]
        }
    })
    .to_string()
}

/// Target that acknowledges every request.
async fn spawn_ack_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if stream.write_all(b"ACK").await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn test_settings(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.crash_dir = dir.join("crashes");
    settings.log_dir = dir.join("logs");
    settings.checkpoint_frequency = 10;
    settings
}

/// End-to-end smoke run: a bounded session against a live target
/// completes, accumulates stats and coverage, and leaves a monotonic
/// execution history.
#[tokio::test]
async fn bounded_session_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_ack_server().await;

    let store = SessionStore::open_in_memory().unwrap();
    let history = HistoryStore::open_in_memory().unwrap();
    let manager = SessionManager::new(test_settings(dir.path()), store, history.clone());
    manager.register_plugin(PluginBundle::from_json(&plugin_json()).unwrap());

    let mut config = SessionConfig::new(
        "simple_tcp",
        "127.0.0.1",
        addr.port(),
        protofuzz::plugin::TransportKind::Tcp,
    );
    config.timeout_ms = 500;
    config.max_iterations = Some(20);

    let session = manager.create_session(config).await.unwrap();
    assert_eq!(session.status, SessionStatus::Idle);
    let id = session.id.clone();

    manager.start_session(&id).await.unwrap();

    // Wait for the iteration cap; each exchange includes a short idle-read
    // window, so give it a generous deadline.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(60);
    loop {
        let session = manager.get_session(&id).await.unwrap();
        if session.status != SessionStatus::Running {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "session did not finish");
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    let _ = manager.stop_session(&id).await;

    let session = manager.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.iterations, 20);
    assert_eq!(session.stats.total_tests, 20);
    assert_eq!(session.stats.passes, 20);
    assert!(session.started_at.is_some());
    assert!(session.stopped_at.is_some());

    // Stateful coverage accumulated and was snapshotted at stop.
    assert!(session.current_state.is_some());
    assert!(!session.coverage.state_coverage.is_empty());
    assert!(session.coverage.snapshot.is_some());

    // Sequence monotonicity: replay order is exactly 1..=20.
    let records = history.list_for_replay(&id, 100).await.unwrap();
    let sequences: Vec<i64> = records.iter().map(|r| r.sequence_number).collect();
    assert_eq!(sequences, (1..=20).collect::<Vec<i64>>());

    // Every record carries the payload and the target's response.
    for record in &records {
        assert!(!record.payload.is_empty());
        assert_eq!(record.response.as_deref(), Some(b"ACK".as_slice()));
        assert!(record.state_at_send.is_some());
    }
}

/// A session with no seeds fails initialization with an actionable error.
#[tokio::test]
async fn seedless_plugin_fails_session_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open_in_memory().unwrap();
    let history = HistoryStore::open_in_memory().unwrap();
    let manager = SessionManager::new(test_settings(dir.path()), store, history);

    let raw = serde_json::json!({
        "name": "seedless",
        "transport": "tcp",
        "data_model": {
            "blocks": [{"name": "byte", "type": "uint8"}]
        }
    })
    .to_string();
    manager.register_plugin(PluginBundle::from_json(&raw).unwrap());

    let config = SessionConfig::new(
        "seedless",
        "127.0.0.1",
        1,
        protofuzz::plugin::TransportKind::Tcp,
    );
    let session = manager.create_session(config).await.unwrap();
    let err = manager.start_session(&session.id).await.unwrap_err();
    assert!(err.to_string().contains("no seeds"));

    let failed = manager.get_session(&session.id).await.unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);
    assert!(failed.error_message.unwrap().contains("no seeds"));
}

/// Concurrency cap: starting one session more than allowed names the
/// sessions holding the slots.
#[tokio::test]
async fn concurrent_session_cap_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_ack_server().await;

    let mut settings = test_settings(dir.path());
    settings.max_concurrent_sessions = 1;

    let store = SessionStore::open_in_memory().unwrap();
    let history = HistoryStore::open_in_memory().unwrap();
    let manager = SessionManager::new(settings, store, history);
    manager.register_plugin(PluginBundle::from_json(&plugin_json()).unwrap());

    let mut config = SessionConfig::new(
        "simple_tcp",
        "127.0.0.1",
        addr.port(),
        protofuzz::plugin::TransportKind::Tcp,
    );
    config.timeout_ms = 500;
    config.max_iterations = Some(10_000);

    let first = manager.create_session(config.clone()).await.unwrap();
    let second = manager.create_session(config).await.unwrap();

    manager.start_session(&first.id).await.unwrap();
    let err = manager.start_session(&second.id).await.unwrap_err();
    assert!(err.to_string().contains(&first.id));

    manager.stop_session(&first.id).await.unwrap();
}
