//! # Agent Dispatch
//!
//! The remote-execution interface: registered agents poll per-target
//! queues for work items and post results back, correlated by test-case
//! id rather than order. The dispatcher only manages queues and pending
//! bookkeeping; the agent binary, its transport, and its process monitor
//! live outside the core.

use crate::error::AgentError;
use crate::plugin::TransportKind;
use crate::session::TestCaseResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// One unit of work shipped to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWorkItem {
    pub session_id: String,
    pub test_case_id: String,
    pub protocol: String,
    pub target_host: String,
    pub target_port: u16,
    pub transport: TransportKind,
    /// Payload bytes, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub timeout_ms: u64,
}

/// An agent's verdict for one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub session_id: String,
    pub test_case_id: String,
    pub result: TestCaseResult,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage_mb: Option<f64>,
    #[serde(default)]
    pub crashed: bool,
    #[serde(default)]
    pub hung: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_base64_bytes")]
    pub response: Option<Vec<u8>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Registered agent bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub metrics: serde_json::Value,
}

/// Pending-test bookkeeping, returned when the matching result arrives.
#[derive(Debug, Clone)]
pub struct CorrelatedTest {
    pub session_id: String,
    pub protocol: String,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

/// Per-target work queues plus pending-result correlation.
pub struct AgentDispatcher {
    queues: Mutex<HashMap<String, VecDeque<AgentWorkItem>>>,
    pending: Mutex<HashMap<String, CorrelatedTest>>,
    agents: Mutex<HashMap<String, AgentInfo>>,
    queue_capacity: usize,
    agent_timeout_sec: u64,
}

impl AgentDispatcher {
    pub fn new(queue_capacity: usize, agent_timeout_sec: u64) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            agents: Mutex::new(HashMap::new()),
            queue_capacity,
            agent_timeout_sec,
        }
    }

    fn queue_key(host: &str, port: u16, transport: TransportKind) -> String {
        format!("{host}:{port}:{transport}")
    }

    pub fn register_agent(
        &self,
        agent_id: &str,
        host: &str,
        port: u16,
        transport: TransportKind,
    ) -> AgentInfo {
        let info = AgentInfo {
            agent_id: agent_id.to_string(),
            host: host.to_string(),
            port,
            transport,
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
            metrics: serde_json::Value::Null,
        };
        info!(agent_id, host, port, "agent registered");
        self.agents.lock().insert(agent_id.to_string(), info.clone());
        info
    }

    pub fn agent_heartbeat(
        &self,
        agent_id: &str,
        metrics: serde_json::Value,
    ) -> Result<(), AgentError> {
        let mut agents = self.agents.lock();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentError::NotRegistered(agent_id.to_string()))?;
        agent.last_heartbeat = Utc::now();
        agent.metrics = metrics;
        Ok(())
    }

    pub fn list_agents(&self) -> Vec<AgentInfo> {
        self.agents.lock().values().cloned().collect()
    }

    /// Drop agents whose last heartbeat is older than the timeout.
    pub fn expire_stale_agents(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.agent_timeout_sec as i64);
        let mut agents = self.agents.lock();
        let before = agents.len();
        agents.retain(|id, info| {
            let alive = info.last_heartbeat >= cutoff;
            if !alive {
                warn!(agent_id = %id, "agent expired");
            }
            alive
        });
        before - agents.len()
    }

    /// Queue a work item for its target. Fails when the target queue is at
    /// capacity.
    pub fn enqueue(&self, item: AgentWorkItem) -> Result<(), AgentError> {
        let key = Self::queue_key(&item.target_host, item.target_port, item.transport);
        let mut queues = self.queues.lock();
        let queue = queues.entry(key.clone()).or_default();
        if queue.len() >= self.queue_capacity {
            return Err(AgentError::QueueFull {
                target: key,
                capacity: self.queue_capacity,
            });
        }
        self.pending.lock().insert(
            item.test_case_id.clone(),
            CorrelatedTest {
                session_id: item.session_id.clone(),
                protocol: item.protocol.clone(),
                payload: item.data.clone(),
                enqueued_at: Utc::now(),
            },
        );
        debug!(target = %key, test_case_id = %item.test_case_id, "work item queued");
        queue.push_back(item);
        Ok(())
    }

    /// Next work item for an agent's target, or None (the HTTP layer maps
    /// that to 204).
    pub fn next_case(
        &self,
        host: &str,
        port: u16,
        transport: TransportKind,
    ) -> Option<AgentWorkItem> {
        let key = Self::queue_key(host, port, transport);
        self.queues.lock().get_mut(&key)?.pop_front()
    }

    /// Correlate a result with its pending entry. Unknown ids (a stale
    /// agent, a cleared session) return None and are dropped by the
    /// caller.
    pub fn submit_result(&self, result: &AgentResult) -> Option<CorrelatedTest> {
        let pending = self.pending.lock().remove(&result.test_case_id)?;
        let waited_ms = (Utc::now() - pending.enqueued_at).num_milliseconds();
        debug!(
            test_case_id = %result.test_case_id,
            session_id = %pending.session_id,
            waited_ms,
            "agent result correlated"
        );
        Some(pending)
    }

    pub fn pending_count(&self, session_id: &str) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|p| p.session_id == session_id)
            .count()
    }

    /// Drop queued work and pending entries for a session (session stop or
    /// delete).
    pub fn clear_session(&self, session_id: &str) {
        let mut queues = self.queues.lock();
        for queue in queues.values_mut() {
            queue.retain(|item| item.session_id != session_id);
        }
        self.pending
            .lock()
            .retain(|_, pending| pending.session_id != session_id);
        debug!(session_id, "agent work cleared for session");
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(serde::de::Error::custom)
    }
}

mod opt_base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer
                .serialize_some(&base64::engine::general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| {
            base64::engine::general_purpose::STANDARD
                .decode(s)
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(session: &str, test: &str) -> AgentWorkItem {
        AgentWorkItem {
            session_id: session.to_string(),
            test_case_id: test.to_string(),
            protocol: "simple_tcp".into(),
            target_host: "10.0.0.5".into(),
            target_port: 9999,
            transport: TransportKind::Tcp,
            data: vec![1, 2, 3],
            timeout_ms: 5_000,
        }
    }

    #[test]
    fn queue_round_trip_and_correlation() {
        let dispatcher = AgentDispatcher::new(16, 60);
        dispatcher.enqueue(item("s1", "t1")).unwrap();
        dispatcher.enqueue(item("s1", "t2")).unwrap();

        let first = dispatcher
            .next_case("10.0.0.5", 9999, TransportKind::Tcp)
            .unwrap();
        assert_eq!(first.test_case_id, "t1");

        let result = AgentResult {
            session_id: "s1".into(),
            test_case_id: "t1".into(),
            result: TestCaseResult::Crash,
            execution_time_ms: 12,
            cpu_usage: Some(4.2),
            memory_usage_mb: None,
            crashed: true,
            hung: false,
            response: None,
            metadata: serde_json::Value::Null,
        };
        assert_eq!(
            dispatcher.submit_result(&result).map(|c| c.session_id).as_deref(),
            Some("s1")
        );
        // Results may arrive out of order and ids are correlated once.
        assert!(dispatcher.submit_result(&result).is_none());
        assert_eq!(dispatcher.pending_count("s1"), 1);
    }

    #[test]
    fn queue_capacity_is_enforced() {
        let dispatcher = AgentDispatcher::new(1, 60);
        dispatcher.enqueue(item("s1", "t1")).unwrap();
        let err = dispatcher.enqueue(item("s1", "t2")).unwrap_err();
        assert!(matches!(err, AgentError::QueueFull { .. }));
    }

    #[test]
    fn clear_session_drops_queued_work() {
        let dispatcher = AgentDispatcher::new(16, 60);
        dispatcher.enqueue(item("s1", "t1")).unwrap();
        dispatcher.enqueue(item("s2", "t2")).unwrap();
        dispatcher.clear_session("s1");

        assert_eq!(dispatcher.pending_count("s1"), 0);
        let next = dispatcher
            .next_case("10.0.0.5", 9999, TransportKind::Tcp)
            .unwrap();
        assert_eq!(next.session_id, "s2");
    }

    #[test]
    fn work_item_wire_format_uses_base64() {
        let encoded = serde_json::to_value(item("s1", "t1")).unwrap();
        assert_eq!(encoded["data"], "AQID");
        let decoded: AgentWorkItem = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.data, vec![1, 2, 3]);
    }

    #[test]
    fn stale_agents_expire() {
        let dispatcher = AgentDispatcher::new(16, 0);
        dispatcher.register_agent("a1", "10.0.0.9", 7000, TransportKind::Tcp);
        // Timeout of zero seconds: anything already registered is stale.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(dispatcher.expire_stale_agents(), 1);
        assert!(dispatcher
            .agent_heartbeat("a1", serde_json::Value::Null)
            .is_err());
    }
}
