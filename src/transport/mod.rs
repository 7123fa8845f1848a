//! # Transport Layer
//!
//! Two ways to talk to the target:
//!
//! - **Ephemeral** exchanges ([`exchange`]): open, send, read with timeout,
//!   close: one connection per call. TCP responses are read in chunks
//!   until the stream goes idle, capped at `max_response_bytes`; UDP sends
//!   one datagram and waits for one reply.
//! - **Managed** transports ([`managed::ManagedTransport`]): persistent
//!   TCP connections with an internal send mutex, health tracking and
//!   stats, owned by the [`manager::ConnectionManager`].
//!
//! All failures map onto the [`TransportError`] taxonomy; the fuzzing loop
//! turns those into test-case verdicts at its boundary.

pub mod managed;
pub mod manager;

use crate::error::TransportError;
use crate::plugin::TransportKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

/// Idle window after the first response chunk; more data arriving within
/// it is treated as part of the same response.
pub(crate) const IDLE_READ_MS: u64 = 50;

/// Parameters for ephemeral exchanges.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub timeout_ms: u64,
    pub max_response_bytes: usize,
    pub buffer_size: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_response_bytes: 1024 * 1024,
            buffer_size: 8192,
        }
    }
}

/// One-shot exchange over the given transport kind.
pub async fn exchange(
    kind: TransportKind,
    host: &str,
    port: u16,
    payload: &[u8],
    config: &ExchangeConfig,
) -> Result<Vec<u8>, TransportError> {
    match kind {
        TransportKind::Tcp => tcp_exchange(host, port, payload, config).await,
        TransportKind::Udp => udp_exchange(host, port, payload, config).await,
    }
}

/// Open a TCP connection with the fuzzer's socket options applied.
pub(crate) async fn open_tcp(
    host: &str,
    port: u16,
    timeout_ms: u64,
    buffer_size: usize,
) -> Result<TcpStream, TransportError> {
    let addr = format!("{host}:{port}");
    let connect = TcpStream::connect(&addr);
    let stream = match timeout(Duration::from_millis(timeout_ms), connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
            return Err(TransportError::ConnectionRefused { addr });
        }
        Ok(Err(err)) => {
            return Err(TransportError::Other(format!("connect to {addr}: {err}")));
        }
        Err(_) => {
            return Err(TransportError::ConnectionTimeout {
                addr,
                timeout_ms,
            });
        }
    };

    // Low-latency options; failures here are not fatal for the exchange.
    let std_stream = stream
        .into_std()
        .map_err(|e| TransportError::Other(e.to_string()))?;
    let socket = socket2::Socket::from(
        std_stream
            .try_clone()
            .map_err(|e| TransportError::Other(e.to_string()))?,
    );
    let _ = socket.set_nodelay(true);
    let _ = socket.set_recv_buffer_size(buffer_size);
    let _ = socket.set_send_buffer_size(buffer_size);

    TcpStream::from_std(std_stream).map_err(|e| TransportError::Other(e.to_string()))
}

async fn tcp_exchange(
    host: &str,
    port: u16,
    payload: &[u8],
    config: &ExchangeConfig,
) -> Result<Vec<u8>, TransportError> {
    let mut stream = open_tcp(host, port, config.timeout_ms, config.buffer_size).await?;

    stream
        .write_all(payload)
        .await
        .map_err(|e| TransportError::Send(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| TransportError::Send(e.to_string()))?;
    debug!(bytes = payload.len(), "tcp payload sent");

    let response = read_tcp_response(&mut stream, config.timeout_ms, config.max_response_bytes)
        .await?;
    let _ = stream.shutdown().await;
    Ok(response)
}

/// Read a TCP response: wait up to `timeout_ms` for the first chunk, then
/// keep concatenating chunks until the stream goes idle, the peer closes,
/// or the cap is reached.
pub(crate) async fn read_tcp_response(
    stream: &mut TcpStream,
    timeout_ms: u64,
    max_response_bytes: usize,
) -> Result<Vec<u8>, TransportError> {
    let mut response = Vec::new();
    let mut buf = vec![0u8; 8192];
    let mut wait_ms = timeout_ms;

    loop {
        match timeout(Duration::from_millis(wait_ms), stream.read(&mut buf)).await {
            Ok(Ok(0)) => break, // peer closed
            Ok(Ok(n)) => {
                response.extend_from_slice(&buf[..n]);
                if response.len() >= max_response_bytes {
                    response.truncate(max_response_bytes);
                    break;
                }
                wait_ms = IDLE_READ_MS;
            }
            Ok(Err(err)) => {
                if response.is_empty() {
                    return Err(TransportError::Receive(err.to_string()));
                }
                break;
            }
            Err(_) => {
                if response.is_empty() {
                    return Err(TransportError::ReceiveTimeout { timeout_ms });
                }
                break; // idle: response complete
            }
        }
    }

    Ok(response)
}

async fn udp_exchange(
    host: &str,
    port: u16,
    payload: &[u8],
    config: &ExchangeConfig,
) -> Result<Vec<u8>, TransportError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| TransportError::Other(e.to_string()))?;
    let addr = format!("{host}:{port}");
    socket
        .connect(&addr)
        .await
        .map_err(|e| TransportError::Other(format!("connect {addr}: {e}")))?;

    socket
        .send(payload)
        .await
        .map_err(|e| TransportError::Send(e.to_string()))?;
    debug!(bytes = payload.len(), "udp datagram sent");

    let mut buf = vec![0u8; config.max_response_bytes.min(65536).max(1)];
    match timeout(Duration::from_millis(config.timeout_ms), socket.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            Ok(buf)
        }
        Ok(Err(err)) => {
            // A prior ICMP port-unreachable surfaces as ConnectionRefused
            // on the next socket operation.
            if err.kind() == std::io::ErrorKind::ConnectionRefused {
                Err(TransportError::ConnectionRefused { addr })
            } else {
                Err(TransportError::Receive(err.to_string()))
            }
        }
        Err(_) => Err(TransportError::ReceiveTimeout {
            timeout_ms: config.timeout_ms,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_exchange_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert_eq!(buf[..n].to_vec(), b"PING".to_vec());
            stream.write_all(b"PONG").await.unwrap();
        });

        let response = exchange(
            TransportKind::Tcp,
            "127.0.0.1",
            addr.port(),
            b"PING",
            &ExchangeConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(response, b"PONG");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_maps_to_connection_refused() {
        // Bind then drop to find a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = exchange(
            TransportKind::Tcp,
            "127.0.0.1",
            port,
            b"X",
            &ExchangeConfig {
                timeout_ms: 1_000,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused { .. }));
    }

    #[tokio::test]
    async fn silent_server_maps_to_receive_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the connection open without responding.
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(stream);
        });

        let err = exchange(
            TransportKind::Tcp,
            "127.0.0.1",
            addr.port(),
            b"X",
            &ExchangeConfig {
                timeout_ms: 100,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn udp_exchange_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], peer).await.unwrap();
        });

        let response = exchange(
            TransportKind::Udp,
            "127.0.0.1",
            addr.port(),
            b"ECHO",
            &ExchangeConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(response, b"ECHO");
    }

    #[tokio::test]
    async fn response_cap_is_enforced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(&vec![0xAA; 4096]).await.unwrap();
        });

        let response = exchange(
            TransportKind::Tcp,
            "127.0.0.1",
            addr.port(),
            b"X",
            &ExchangeConfig {
                timeout_ms: 1_000,
                max_response_bytes: 100,
                buffer_size: 8192,
            },
        )
        .await
        .unwrap();
        assert_eq!(response.len(), 100);
        server.await.unwrap();
    }
}
