use protofuzz::engine::stage_runner::{StageRunner, StageState};
use protofuzz::error::BootstrapError;
use protofuzz::plugin::{
    Block, BlockType, ConnectionMode, DataModel, ExportSpec, RetryPolicy, Stage, StageRole,
    TransportKind,
};
use protofuzz::session::context::{new_context_handle, ContextValue};
use protofuzz::transport::manager::{ConnectOptions, ConnectionManager};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn auth_request_model() -> DataModel {
    let mut magic = Block::new("magic", BlockType::Bytes);
    magic.size = Some(4);
    magic.default = Some(serde_json::Value::String(
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"BOOT"),
    ));
    let mut command = Block::new("command", BlockType::Uint8);
    command.default = Some(serde_json::json!(0x01));
    DataModel {
        name: None,
        description: None,
        blocks: vec![magic, command],
        seeds: Vec::new(),
    }
}

fn auth_response_model() -> DataModel {
    DataModel {
        name: None,
        description: None,
        blocks: vec![
            Block::new("status", BlockType::Uint8),
            Block::new("token", BlockType::Uint32),
        ],
        seeds: Vec::new(),
    }
}

fn auth_stage() -> Stage {
    Stage {
        name: "auth".into(),
        role: StageRole::Bootstrap,
        data_model: auth_request_model(),
        response_model: Some(auth_response_model()),
        expect: [("status".to_string(), serde_json::json!(0))]
            .into_iter()
            .collect(),
        exports: [(
            "token".to_string(),
            ExportSpec::Key("auth_token".to_string()),
        )]
        .into_iter()
        .collect(),
        retry: Some(RetryPolicy {
            max_attempts: 3,
            backoff_ms: 10,
        }),
    }
}

/// Spawn a bootstrap target that answers every request with the given
/// status byte and token, counting requests served.
async fn spawn_auth_server(status: u8, token: u32) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    let mut reply = vec![status];
                    reply.extend_from_slice(&token.to_be_bytes());
                    if stream.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, requests)
}

fn options(addr: std::net::SocketAddr) -> ConnectOptions {
    ConnectOptions {
        host: "127.0.0.1".into(),
        port: addr.port(),
        transport: TransportKind::Tcp,
        timeout_ms: 1_000,
        max_response_bytes: 65536,
        buffer_size: 8192,
    }
}

/// Scenario C, happy path: after the stage, the exported token is in the
/// context and bootstrap is marked complete.
#[tokio::test]
async fn bootstrap_exports_token_into_context() {
    let (addr, _requests) = spawn_auth_server(0x00, 0x1234_5678).await;
    let manager = Arc::new(ConnectionManager::new(10));
    let runner = StageRunner::new(
        "session-1",
        "orchestrated",
        vec![auth_stage()],
        manager.clone(),
        options(addr),
        ConnectionMode::Session,
        None,
    );

    let context = new_context_handle();
    runner.run_bootstrap(&context).await.unwrap();

    let ctx = context.lock();
    assert_eq!(ctx.get("auth_token"), Some(&ContextValue::Uint(0x1234_5678)));
    assert!(ctx.bootstrap_complete());
    drop(ctx);

    let status = runner.stage_status("auth").unwrap();
    assert_eq!(status.state, StageState::Complete);
    assert_eq!(status.exports_captured, vec!["auth_token".to_string()]);

    manager.close_session("session-1").await;
}

/// Scenario C, rejection path: a status mismatch raises a validation
/// error and is not retried.
#[tokio::test]
async fn expectation_mismatch_is_not_retried() {
    let (addr, requests) = spawn_auth_server(0x01, 0x1234_5678).await;
    let manager = Arc::new(ConnectionManager::new(10));
    let runner = StageRunner::new(
        "session-2",
        "orchestrated",
        vec![auth_stage()],
        manager.clone(),
        options(addr),
        ConnectionMode::Session,
        None,
    );

    let context = new_context_handle();
    let err = runner.run_bootstrap(&context).await.unwrap_err();
    match &err {
        BootstrapError::Validation { stage, field, .. } => {
            assert_eq!(stage, "auth");
            assert_eq!(field, "status");
        }
        other => panic!("expected validation error, got {other}"),
    }
    assert!(!err.is_retryable());

    // Exactly one request hit the target: validation failures never retry.
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert!(!context.lock().bootstrap_complete());
    assert_eq!(
        runner.stage_status("auth").unwrap().state,
        StageState::Failed
    );

    manager.close_session("session-2").await;
}

/// Transport failures retry up to `max_attempts` before surfacing.
#[tokio::test]
async fn transport_failures_retry_up_to_max_attempts() {
    // A port with no listener: every attempt is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let manager = Arc::new(ConnectionManager::new(10));
    let runner = StageRunner::new(
        "session-3",
        "orchestrated",
        vec![auth_stage()],
        manager.clone(),
        options(addr),
        ConnectionMode::Session,
        None,
    );

    let context = new_context_handle();
    let err = runner.run_bootstrap(&context).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(runner.stage_status("auth").unwrap().attempts, 3);
}
