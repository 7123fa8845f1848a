//! # Managed Transports
//!
//! A managed transport is a persistent TCP connection wrapper carrying
//! health flags, traffic counters, and a send mutex. The mutex serializes
//! every send on the connection: this is what keeps heartbeat traffic
//! from interleaving with fuzz-loop traffic on the same stream. Only TCP
//! supports persistent mode; UDP callers get an error.

use crate::error::TransportError;
use crate::transport::{open_tcp, read_tcp_response};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Traffic counters and timestamps for one managed transport.
#[derive(Debug, Clone)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_count: u64,
    pub recv_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_send: Option<DateTime<Utc>>,
    pub last_recv: Option<DateTime<Utc>>,
}

/// Persistent TCP connection with send serialization and health tracking.
pub struct ManagedTransport {
    host: String,
    port: u16,
    timeout_ms: u64,
    max_response_bytes: usize,
    buffer_size: usize,

    /// Guards the stream; every send path locks it, so sends never overlap.
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    healthy: AtomicBool,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_count: AtomicU64,
    recv_count: AtomicU64,
    created_at: DateTime<Utc>,
    last_send: parking_lot::Mutex<Option<DateTime<Utc>>>,
    last_recv: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl ManagedTransport {
    pub fn new(
        host: &str,
        port: u16,
        timeout_ms: u64,
        max_response_bytes: usize,
        buffer_size: usize,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout_ms,
            max_response_bytes,
            buffer_size,
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            send_count: AtomicU64::new(0),
            recv_count: AtomicU64::new(0),
            created_at: Utc::now(),
            last_send: parking_lot::Mutex::new(None),
            last_recv: parking_lot::Mutex::new(None),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    /// Establish the connection. Idempotent while connected.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() && self.is_connected() {
            return Ok(());
        }
        let stream = open_tcp(&self.host, self.port, self.timeout_ms, self.buffer_size).await?;
        *guard = Some(stream);
        self.connected.store(true, Ordering::Relaxed);
        self.healthy.store(true, Ordering::Relaxed);
        debug!(addr = %self.addr(), "managed transport connected");
        Ok(())
    }

    /// Send without waiting for a response.
    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| {
            TransportError::Other("managed transport is not connected".into())
        })?;
        match Self::write_payload(stream, data).await {
            Ok(()) => {
                self.note_send(data.len());
                Ok(())
            }
            Err(err) => {
                self.mark_unhealthy();
                Err(err)
            }
        }
    }

    /// Receive one response, honoring an optional timeout override.
    pub async fn recv(&self, timeout_ms: Option<u64>) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| {
            TransportError::Other("managed transport is not connected".into())
        })?;
        let wait = timeout_ms.unwrap_or(self.timeout_ms);
        match read_tcp_response(stream, wait, self.max_response_bytes).await {
            Ok(response) => {
                self.note_recv(response.len());
                Ok(response)
            }
            Err(err) => {
                if !err.is_timeout() {
                    self.mark_unhealthy();
                }
                Err(err)
            }
        }
    }

    /// Send and wait for the response under one lock acquisition, so the
    /// request/response pair cannot interleave with another sender.
    pub async fn send_and_receive(
        &self,
        data: &[u8],
        timeout_ms: Option<u64>,
    ) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| {
            TransportError::Other("managed transport is not connected".into())
        })?;

        if let Err(err) = Self::write_payload(stream, data).await {
            self.mark_unhealthy();
            return Err(err);
        }
        self.note_send(data.len());

        let wait = timeout_ms.unwrap_or(self.timeout_ms);
        match read_tcp_response(stream, wait, self.max_response_bytes).await {
            Ok(response) => {
                self.note_recv(response.len());
                Ok(response)
            }
            Err(err) => {
                if !err.is_timeout() {
                    self.mark_unhealthy();
                }
                Err(err)
            }
        }
    }

    async fn write_payload(stream: &mut TcpStream, data: &[u8]) -> Result<(), TransportError> {
        stream
            .write_all(data)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    pub async fn close(&self) {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.shutdown().await;
        }
        self.connected.store(false, Ordering::Relaxed);
        debug!(addr = %self.addr(), "managed transport closed");
    }

    fn note_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.send_count.fetch_add(1, Ordering::Relaxed);
        *self.last_send.lock() = Some(Utc::now());
    }

    fn note_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.recv_count.fetch_add(1, Ordering::Relaxed);
        *self.last_recv.lock() = Some(Utc::now());
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_count: self.send_count.load(Ordering::Relaxed),
            recv_count: self.recv_count.load(Ordering::Relaxed),
            created_at: self.created_at,
            last_send: *self.last_send.lock(),
            last_recv: *self.last_recv.lock(),
        }
    }

    pub fn stats_json(&self) -> serde_json::Value {
        let stats = self.stats();
        serde_json::json!({
            "address": self.addr(),
            "connected": self.is_connected(),
            "healthy": self.is_healthy(),
            "bytes_sent": stats.bytes_sent,
            "bytes_received": stats.bytes_received,
            "send_count": stats.send_count,
            "recv_count": stats.recv_count,
            "created_at": stats.created_at.to_rfc3339(),
            "last_send": stats.last_send.map(|t| t.to_rfc3339()),
            "last_recv": stats.last_recv.map(|t| t.to_rfc3339()),
        })
    }
}

impl Drop for ManagedTransport {
    fn drop(&mut self) {
        if self.is_connected() {
            warn!(addr = %self.addr(), "managed transport dropped while connected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_server() -> std::net::SocketAddr {
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
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn send_and_receive_updates_stats() {
        let addr = echo_server().await;
        let transport = ManagedTransport::new("127.0.0.1", addr.port(), 1_000, 65536, 8192);
        transport.connect().await.unwrap();

        let response = transport.send_and_receive(b"HELLO", None).await.unwrap();
        assert_eq!(response, b"HELLO");

        let stats = transport.stats();
        assert_eq!(stats.send_count, 1);
        assert_eq!(stats.recv_count, 1);
        assert_eq!(stats.bytes_sent, 5);
        assert_eq!(stats.bytes_received, 5);
        assert!(stats.last_send.is_some());

        transport.close().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn sends_are_serialized_by_the_mutex() {
        let addr = echo_server().await;
        let transport = Arc::new(ManagedTransport::new(
            "127.0.0.1",
            addr.port(),
            1_000,
            65536,
            8192,
        ));
        transport.connect().await.unwrap();

        // Concurrent request/response pairs on one connection: the lock
        // keeps each pair intact, so every echo matches its request.
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let t = transport.clone();
            handles.push(tokio::spawn(async move {
                let payload = vec![i; 16];
                let response = t.send_and_receive(&payload, None).await.unwrap();
                assert_eq!(response, payload);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(transport.stats().send_count, 8);
        transport.close().await;
    }

    #[tokio::test]
    async fn send_on_closed_connection_is_an_error() {
        let transport = ManagedTransport::new("127.0.0.1", 1, 200, 65536, 8192);
        assert!(transport.send(b"X").await.is_err());
    }
}
