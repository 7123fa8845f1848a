//! # Connection Manager
//!
//! Owns the managed transports of every session, keyed by connection mode:
//! `session` keeps one connection per session, `per_stage` one per
//! (session, stage), and `per_test` always returns a fresh, uncached
//! transport that the caller must close on the same code path.
//!
//! A replay transport can be registered under a distinct key so bootstrap
//! stages executed during a replay share the replay's TCP session instead
//! of touching the live one.

use crate::error::TransportError;
use crate::plugin::{ConnectionMode, TransportKind};
use crate::transport::managed::ManagedTransport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Connection parameters for one target.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub timeout_ms: u64,
    pub max_response_bytes: usize,
    pub buffer_size: usize,
}

/// Session-scoped registry of managed transports.
pub struct ConnectionManager {
    transports: Mutex<HashMap<String, Arc<ManagedTransport>>>,
    reconnect_backoff_ms: u64,
}

impl ConnectionManager {
    pub fn new(reconnect_backoff_ms: u64) -> Self {
        Self {
            transports: Mutex::new(HashMap::new()),
            reconnect_backoff_ms,
        }
    }

    fn connection_id(session_id: &str, mode: ConnectionMode, stage: Option<&str>) -> String {
        match mode {
            ConnectionMode::Session => session_id.to_string(),
            ConnectionMode::PerStage => {
                format!("{session_id}:{}", stage.unwrap_or("default"))
            }
            ConnectionMode::PerTest => uuid::Uuid::new_v4().to_string(),
        }
    }

    fn replay_key(session_id: &str) -> String {
        format!("replay:{session_id}")
    }

    /// Resolve the transport for a call. Persistent modes cache by
    /// connection id and replace unhealthy connections; `per_test` always
    /// builds a fresh transport the caller owns and must close.
    pub async fn get_transport(
        &self,
        session_id: &str,
        mode: ConnectionMode,
        stage: Option<&str>,
        options: &ConnectOptions,
    ) -> Result<Arc<ManagedTransport>, TransportError> {
        if options.transport == TransportKind::Udp {
            return Err(TransportError::Other(
                "persistent connections are TCP-only; UDP must use ephemeral exchanges".into(),
            ));
        }

        if mode == ConnectionMode::PerTest {
            let transport = self.build_transport(options);
            transport.connect().await?;
            return Ok(transport);
        }

        let id = Self::connection_id(session_id, mode, stage);
        let mut map = self.transports.lock().await;

        if let Some(existing) = map.get(&id) {
            if existing.is_healthy() && existing.is_connected() {
                return Ok(existing.clone());
            }
            debug!(connection_id = %id, "replacing unhealthy transport");
            existing.close().await;
            map.remove(&id);
        }

        let transport = self.build_transport(options);
        transport.connect().await?;
        map.insert(id.clone(), transport.clone());
        info!(connection_id = %id, addr = %transport.addr(), "managed transport created");
        Ok(transport)
    }

    /// Look up an existing persistent transport without creating one.
    /// Never resolves a replay transport; replay callers use
    /// [`replay_transport`](Self::replay_transport) explicitly.
    pub async fn lookup(
        &self,
        session_id: &str,
        mode: ConnectionMode,
        stage: Option<&str>,
    ) -> Option<Arc<ManagedTransport>> {
        if mode == ConnectionMode::PerTest {
            return None;
        }
        let map = self.transports.lock().await;
        map.get(&Self::connection_id(session_id, mode, stage)).cloned()
    }

    /// The registered replay transport for a session, if any. Kept apart
    /// from the live mapping so a concurrent live session never routes
    /// its traffic onto the replay connection.
    pub async fn replay_transport(&self, session_id: &str) -> Option<Arc<ManagedTransport>> {
        self.transports
            .lock()
            .await
            .get(&Self::replay_key(session_id))
            .cloned()
    }

    fn build_transport(&self, options: &ConnectOptions) -> Arc<ManagedTransport> {
        Arc::new(ManagedTransport::new(
            &options.host,
            options.port,
            options.timeout_ms,
            options.max_response_bytes,
            options.buffer_size,
        ))
    }

    /// Replace a session's transport after a failure: close the old one,
    /// back off, connect a new one. `current_reconnects` is the session's
    /// count so far; at `max_reconnects` the session aborts. The returned
    /// flag carries the caller's rebootstrap intent: re-running bootstrap
    /// stages is the caller's job, not the manager's.
    pub async fn reconnect(
        &self,
        session_id: &str,
        mode: ConnectionMode,
        stage: Option<&str>,
        options: &ConnectOptions,
        current_reconnects: u32,
        max_reconnects: u32,
        rebootstrap: bool,
    ) -> Result<bool, TransportError> {
        if current_reconnects >= max_reconnects {
            return Err(TransportError::ConnectionAbort {
                reconnects: current_reconnects,
                max: max_reconnects,
            });
        }

        let id = Self::connection_id(session_id, mode, stage);
        {
            let mut map = self.transports.lock().await;
            if let Some(old) = map.remove(&id) {
                old.close().await;
            }
        }

        tokio::time::sleep(Duration::from_millis(self.reconnect_backoff_ms)).await;

        let transport = self.build_transport(options);
        transport.connect().await?;
        self.transports
            .lock()
            .await
            .insert(id.clone(), transport.clone());
        info!(
            connection_id = %id,
            attempt = current_reconnects + 1,
            rebootstrap,
            "reconnected"
        );
        Ok(rebootstrap)
    }

    /// Register a replay-owned transport for a session. The manager only
    /// borrows it; the replay executor remains responsible for closing it.
    pub async fn register_replay_transport(
        &self,
        session_id: &str,
        transport: Arc<ManagedTransport>,
    ) {
        self.transports
            .lock()
            .await
            .insert(Self::replay_key(session_id), transport);
        debug!(session_id, "replay transport registered");
    }

    pub async fn unregister_replay_transport(&self, session_id: &str) {
        if self
            .transports
            .lock()
            .await
            .remove(&Self::replay_key(session_id))
            .is_some()
        {
            debug!(session_id, "replay transport unregistered");
        }
    }

    /// Close and drop every transport belonging to a session.
    pub async fn close_session(&self, session_id: &str) {
        let mut map = self.transports.lock().await;
        let stage_prefix = format!("{session_id}:");
        let replay_key = Self::replay_key(session_id);
        let keys: Vec<String> = map
            .keys()
            .filter(|k| {
                let k = k.as_str();
                k == session_id || k.starts_with(&stage_prefix) || k == replay_key
            })
            .cloned()
            .collect();
        for key in keys {
            if let Some(transport) = map.remove(&key) {
                transport.close().await;
                debug!(connection_id = %key, "session transport closed");
            }
        }
    }

    pub async fn close_all(&self) {
        let mut map = self.transports.lock().await;
        for (key, transport) in map.drain() {
            transport.close().await;
            debug!(connection_id = %key, "transport closed");
        }
    }

    /// Stats for the session's primary transport, if one exists.
    pub async fn transport_stats(
        &self,
        session_id: &str,
        mode: ConnectionMode,
        stage: Option<&str>,
    ) -> Option<serde_json::Value> {
        self.lookup(session_id, mode, stage)
            .await
            .map(|t| t.stats_json())
    }
}
