//! # Test Executor
//!
//! Sends one test case to the target and classifies the outcome. Errors
//! never escape the test-case boundary: every transport failure maps onto
//! a verdict here: refused connections and broken sends are crashes,
//! timeouts are hangs. The optional protocol response check can
//! downgrade an otherwise-passing result to `logical_failure`.

use crate::error::TransportError;
use crate::plugin::{ConnectionMode, ResponseCheck, TransportKind};
use crate::session::TestCaseResult;
use crate::transport::manager::{ConnectOptions, ConnectionManager};
use crate::transport::ExchangeConfig;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Verdict plus everything observed for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub result: TestCaseResult,
    pub response: Option<Vec<u8>>,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Per-connection send ordinal, for managed transports.
    pub connection_sequence: Option<i64>,
}

/// How one execution should reach the target.
#[derive(Debug, Clone)]
pub struct ExecutionTarget {
    pub session_id: String,
    pub options: ConnectOptions,
    pub connection_mode: ConnectionMode,
    /// Stage key for per-stage managed connections.
    pub stage_name: Option<String>,
    /// Managed transports only make sense for orchestrated sessions.
    pub orchestrated: bool,
}

/// Executes test cases over managed or ephemeral transports.
pub struct TestExecutor {
    manager: Arc<ConnectionManager>,
    response_check: Option<ResponseCheck>,
}

impl TestExecutor {
    pub fn new(manager: Arc<ConnectionManager>, response_check: Option<ResponseCheck>) -> Self {
        Self {
            manager,
            response_check,
        }
    }

    /// Send the payload and classify the result.
    pub async fn execute(&self, target: &ExecutionTarget, payload: &[u8]) -> ExecutionOutcome {
        let started = Instant::now();
        let use_managed = target.orchestrated
            && target.connection_mode != ConnectionMode::PerTest
            && target.options.transport == TransportKind::Tcp;

        let (result, connection_sequence) = if use_managed {
            self.send_managed(target, payload).await
        } else {
            let outcome = crate::transport::exchange(
                target.options.transport,
                &target.options.host,
                target.options.port,
                payload,
                &ExchangeConfig {
                    timeout_ms: target.options.timeout_ms,
                    max_response_bytes: target.options.max_response_bytes,
                    buffer_size: target.options.buffer_size,
                },
            )
            .await;
            (outcome, None)
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(response) => {
                let verdict = self.classify_response(&response);
                ExecutionOutcome {
                    result: verdict,
                    response: Some(response),
                    duration_ms,
                    error: None,
                    connection_sequence,
                }
            }
            Err(err) => self.classify_error(target, err, duration_ms, connection_sequence),
        }
    }

    async fn send_managed(
        &self,
        target: &ExecutionTarget,
        payload: &[u8],
    ) -> (Result<Vec<u8>, TransportError>, Option<i64>) {
        let transport = match self
            .manager
            .get_transport(
                &target.session_id,
                target.connection_mode,
                target.stage_name.as_deref(),
                &target.options,
            )
            .await
        {
            Ok(transport) => transport,
            Err(err) => return (Err(err), None),
        };
        let outcome = transport.send_and_receive(payload, None).await;
        let sequence = transport.stats().send_count as i64;
        (outcome, Some(sequence))
    }

    /// Pass unless the plugin's response check rejects the reply.
    fn classify_response(&self, response: &[u8]) -> TestCaseResult {
        match &self.response_check {
            Some(check) if !check.matches(response) => {
                debug!("response failed protocol validation");
                TestCaseResult::LogicalFailure
            }
            _ => TestCaseResult::Pass,
        }
    }

    fn classify_error(
        &self,
        target: &ExecutionTarget,
        err: TransportError,
        duration_ms: u64,
        connection_sequence: Option<i64>,
    ) -> ExecutionOutcome {
        let (result, message) = match &err {
            TransportError::ConnectionRefused { .. } => {
                error!(
                    host = %target.options.host,
                    port = target.options.port,
                    "target refused connection"
                );
                (
                    TestCaseResult::Crash,
                    Some(connection_refused_guidance(
                        &target.options.host,
                        target.options.port,
                    )),
                )
            }
            TransportError::ConnectionTimeout { .. } | TransportError::ReceiveTimeout { .. } => {
                (TestCaseResult::Hang, Some(err.to_string()))
            }
            _ => (TestCaseResult::Crash, Some(err.to_string())),
        };

        ExecutionOutcome {
            result,
            response: None,
            duration_ms,
            error: message,
            connection_sequence,
        }
    }
}

/// Actionable message for the common refused-connection case, including
/// container networking alternatives.
pub fn connection_refused_guidance(host: &str, port: u16) -> String {
    format!(
        "Connection refused to {host}:{port}. Target may not be running. \
         If running in containers and targeting localhost, use '172.17.0.1' \
         (Docker Linux), 'host.docker.internal' (Docker Mac/Windows), or \
         'host.containers.internal' (Podman 4.1+) instead."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn target(port: u16, timeout_ms: u64) -> ExecutionTarget {
        ExecutionTarget {
            session_id: "s1".into(),
            options: ConnectOptions {
                host: "127.0.0.1".into(),
                port,
                transport: TransportKind::Tcp,
                timeout_ms,
                max_response_bytes: 65536,
                buffer_size: 8192,
            },
            connection_mode: ConnectionMode::PerTest,
            stage_name: None,
            orchestrated: false,
        }
    }

    #[tokio::test]
    async fn pass_with_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"OK").await.unwrap();
        });

        let manager = Arc::new(ConnectionManager::new(10));
        let executor = TestExecutor::new(manager, None);
        let outcome = executor.execute(&target(port, 1_000), b"TEST").await;
        assert_eq!(outcome.result, TestCaseResult::Pass);
        assert_eq!(outcome.response.as_deref(), Some(b"OK".as_slice()));
    }

    #[tokio::test]
    async fn refused_is_a_crash_with_guidance() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = Arc::new(ConnectionManager::new(10));
        let executor = TestExecutor::new(manager, None);
        let outcome = executor.execute(&target(port, 500), b"TEST").await;
        assert_eq!(outcome.result, TestCaseResult::Crash);
        assert!(outcome.error.unwrap().contains("host.docker.internal"));
    }

    #[tokio::test]
    async fn silence_is_a_hang() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(400)).await;
            drop(stream);
        });

        let manager = Arc::new(ConnectionManager::new(10));
        let executor = TestExecutor::new(manager, None);
        let outcome = executor.execute(&target(port, 100), b"TEST").await;
        assert_eq!(outcome.result, TestCaseResult::Hang);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn failed_validation_is_logical_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"ERR").await.unwrap();
        });

        let manager = Arc::new(ConnectionManager::new(10));
        let executor = TestExecutor::new(manager, Some(ResponseCheck::Prefix(vec![b'O', b'K'])));
        let outcome = executor.execute(&target(port, 1_000), b"TEST").await;
        assert_eq!(outcome.result, TestCaseResult::LogicalFailure);
    }
}
