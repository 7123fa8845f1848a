use protofuzz::history::replay::{ReplayExecutor, ReplayMode, ReplayRequest};
use protofuzz::history::{HistoryStore, RecordInput};
use protofuzz::plugin::{Block, BlockType, DataModel, PluginBundle, TransportKind};
use protofuzz::session::context::{ContextStore, ContextValue};
use protofuzz::session::TestCaseResult;
use protofuzz::transport::manager::{ConnectOptions, ConnectionManager};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const M1: &[u8] = b"MSG-ONE";
const M2: &[u8] = b"MSG-TWO-LONGER";
const M3: &[u8] = b"MSG-THREE";
const R1: &[u8] = b"RSP-ONE";
const R2: &[u8] = b"RSP-TWO";
const R3: &[u8] = b"RSP-THREE";

fn respond_to(request: &[u8]) -> &'static [u8] {
    if request == M1 {
        R1
    } else if request == M2 {
        R2
    } else if request == M3 {
        R3
    } else {
        b"RSP-UNKNOWN"
    }
}

/// Target that records every received payload and answers from the fixed
/// request/response table.
async fn spawn_replay_target() -> (
    std::net::SocketAddr,
    Arc<parking_lot::Mutex<Vec<Vec<u8>>>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = received.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let request = buf[..n].to_vec();
                    let reply = respond_to(&request);
                    sink.lock().push(request);
                    if stream.write_all(reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, received)
}

fn plugin() -> PluginBundle {
    let mut payload = Block::new("payload", BlockType::Bytes);
    payload.max_size = Some(1024);
    PluginBundle {
        name: "replay_target".into(),
        version: None,
        description: None,
        transport: TransportKind::Tcp,
        data_model: DataModel {
            name: None,
            description: None,
            blocks: vec![payload],
            seeds: Vec::new(),
        },
        response_model: None,
        state_model: None,
        response_handlers: Vec::new(),
        protocol_stack: None,
        connection: None,
        heartbeat: None,
        validate_response: None,
    }
}

async fn seed_history(store: &Arc<HistoryStore>, session_id: &str) {
    let mut context = ContextStore::new();
    context.set("auth_token", ContextValue::Uint(0xABCD));
    context.set_bootstrap_complete(true);
    let snapshot = context.snapshot();

    for (payload, response) in [(M1, R1), (M2, R2), (M3, R3)] {
        store
            .record(RecordInput {
                session_id: session_id.to_string(),
                protocol: "replay_target".into(),
                payload: payload.to_vec(),
                response: Some(response.to_vec()),
                result: Some(TestCaseResult::Pass),
                context_snapshot: Some(snapshot.clone()),
                ..Default::default()
            })
            .await;
    }
    store.flush(2_000).await;
}

/// Scenario E: STORED replay sends the recorded payloads verbatim, in
/// order, and flags responses that match the originals.
#[tokio::test]
async fn stored_replay_reproduces_bytes_in_order() {
    let (addr, received) = spawn_replay_target().await;
    let store = HistoryStore::open_in_memory().unwrap();
    seed_history(&store, "replay-1").await;

    let manager = Arc::new(ConnectionManager::new(10));
    let executor = ReplayExecutor::new(store.clone(), manager.clone());
    let report = executor
        .replay_up_to(
            &ReplayRequest {
                session_id: "replay-1".into(),
                target_sequence: 3,
                mode: ReplayMode::Stored,
                delay_ms: 0,
                stop_on_error: false,
            },
            &plugin(),
            &ConnectOptions {
                host: "127.0.0.1".into(),
                port: addr.port(),
                transport: TransportKind::Tcp,
                timeout_ms: 1_000,
                max_response_bytes: 65536,
                buffer_size: 8192,
            },
        )
        .await
        .unwrap();

    assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
    assert_eq!(report.results.len(), 3);
    for (result, expected_seq) in report.results.iter().zip(1i64..) {
        assert_eq!(result.sequence_number, expected_seq);
        assert_eq!(result.status, "success");
        assert!(result.matched_original, "sequence {expected_seq}");
    }

    let sent = received.lock().clone();
    assert_eq!(sent, vec![M1.to_vec(), M2.to_vec(), M3.to_vec()]);

    // The replay transport is the executor's own and must be gone.
    assert!(manager
        .lookup("replay-1", protofuzz::plugin::ConnectionMode::Session, None)
        .await
        .is_none());
}

/// A changed target response clears `matched_original` without failing
/// the batch.
#[tokio::test]
async fn mismatched_response_is_flagged_not_fatal() {
    let (addr, _received) = spawn_replay_target().await;
    let store = HistoryStore::open_in_memory().unwrap();

    // Record history whose response differs from what the target now says.
    store
        .record(RecordInput {
            session_id: "replay-2".into(),
            protocol: "replay_target".into(),
            payload: M1.to_vec(),
            response: Some(b"STALE-RESPONSE".to_vec()),
            result: Some(TestCaseResult::Pass),
            ..Default::default()
        })
        .await;
    store.flush(2_000).await;

    let manager = Arc::new(ConnectionManager::new(10));
    let executor = ReplayExecutor::new(store, manager);
    let report = executor
        .replay_up_to(
            &ReplayRequest {
                session_id: "replay-2".into(),
                target_sequence: 1,
                mode: ReplayMode::Skip,
                delay_ms: 0,
                stop_on_error: true,
            },
            &plugin(),
            &ConnectOptions {
                host: "127.0.0.1".into(),
                port: addr.port(),
                transport: TransportKind::Tcp,
                timeout_ms: 1_000,
                max_response_bytes: 65536,
                buffer_size: 8192,
            },
        )
        .await
        .unwrap();

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].status, "success");
    assert!(!report.results[0].matched_original);
    // No snapshot restore happened in SKIP mode, yet nothing warned: the
    // mode never looks at context.
    assert!(report.warnings.is_empty());
}

/// Replaying a session with no fuzz history is an error.
#[tokio::test]
async fn missing_history_is_an_error() {
    let store = HistoryStore::open_in_memory().unwrap();
    let manager = Arc::new(ConnectionManager::new(10));
    let executor = ReplayExecutor::new(store, manager);
    let err = executor
        .replay_up_to(
            &ReplayRequest {
                session_id: "nothing-here".into(),
                target_sequence: 5,
                mode: ReplayMode::Stored,
                delay_ms: 0,
                stop_on_error: false,
            },
            &plugin(),
            &ConnectOptions {
                host: "127.0.0.1".into(),
                port: 1,
                transport: TransportKind::Tcp,
                timeout_ms: 200,
                max_response_bytes: 1024,
                buffer_size: 1024,
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no execution history"));
}
