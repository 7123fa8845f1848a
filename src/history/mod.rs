//! # Execution History
//!
//! Durable per-session log of test-case executions. One sqlite row per
//! execution keyed by `(session_id, sequence_number)`, with indexes on
//! send time and result. Fuzz executions get the strictly increasing
//! sequence `1, 2, ..`; bootstrap and teardown executions get `-1, -2, ..`
//! through a direct path that bypasses the fuzz counter but shares the
//! same batched writer.
//!
//! ## Write path
//!
//! `record` assigns the next sequence number, appends the record to a
//! fixed-size in-memory ring (fast recent-UI reads), and enqueues it on an
//! async queue consumed by a background writer that batches up to 100
//! records per transaction. Stopping sessions call [`HistoryStore::flush`]
//! to drain the queue synchronously within a bounded timeout.

pub mod replay;

use crate::session::TestCaseResult;
use anyhow::{Context, Result};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Records kept in the per-session memory ring.
const DEFAULT_CACHE_SIZE: usize = 100;

/// Records per write transaction.
const WRITE_BATCH_SIZE: usize = 100;

/// Bytes of payload/response kept as the preview.
const PREVIEW_BYTES: usize = 64;

/// The durable row for one executed test case.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub session_id: String,
    pub sequence_number: i64,
    pub test_case_id: Option<String>,
    pub timestamp_sent: DateTime<Utc>,
    pub timestamp_response: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub payload: Vec<u8>,
    pub payload_hash: String,
    pub response: Option<Vec<u8>>,
    pub protocol: String,
    pub message_type: Option<String>,
    pub state_at_send: Option<String>,
    pub result: TestCaseResult,
    pub mutation_strategy: Option<String>,
    pub mutators_applied: Vec<String>,
    pub stage_name: Option<String>,
    pub context_snapshot: Option<serde_json::Value>,
    pub parsed_fields: Option<serde_json::Value>,
    pub connection_sequence: Option<i64>,
}

impl ExecutionRecord {
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    pub fn payload_preview(&self) -> &[u8] {
        &self.payload[..self.payload.len().min(PREVIEW_BYTES)]
    }

    pub fn response_size(&self) -> Option<usize> {
        self.response.as_ref().map(Vec::len)
    }

    pub fn response_preview(&self) -> Option<&[u8]> {
        self.response
            .as_ref()
            .map(|r| &r[..r.len().min(PREVIEW_BYTES)])
    }

    /// Control-plane shape: previews as hex, full bodies as base64.
    pub fn to_json(&self) -> serde_json::Value {
        let b64 = base64::engine::general_purpose::STANDARD;
        serde_json::json!({
            "session_id": self.session_id,
            "sequence_number": self.sequence_number,
            "test_case_id": self.test_case_id,
            "timestamp_sent": self.timestamp_sent.to_rfc3339(),
            "timestamp_response": self.timestamp_response.map(|t| t.to_rfc3339()),
            "duration_ms": self.duration_ms,
            "payload_size": self.payload_size(),
            "payload_hash": self.payload_hash,
            "payload_preview": hex::encode(self.payload_preview()),
            "payload": b64.encode(&self.payload),
            "response_size": self.response_size(),
            "response_preview": self.response_preview().map(hex::encode),
            "response": self.response.as_ref().map(|r| b64.encode(r)),
            "protocol": self.protocol,
            "message_type": self.message_type,
            "state_at_send": self.state_at_send,
            "result": self.result.as_str(),
            "mutation_strategy": self.mutation_strategy,
            "mutators_applied": self.mutators_applied,
            "stage_name": self.stage_name,
            "context_snapshot": self.context_snapshot,
            "parsed_fields": self.parsed_fields,
            "connection_sequence": self.connection_sequence,
        })
    }
}

/// Everything the caller knows about one execution; the store adds the
/// sequence number and hash.
#[derive(Debug, Clone, Default)]
pub struct RecordInput {
    pub session_id: String,
    pub protocol: String,
    pub test_case_id: Option<String>,
    pub payload: Vec<u8>,
    pub response: Option<Vec<u8>>,
    pub timestamp_sent: Option<DateTime<Utc>>,
    pub timestamp_response: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: Option<TestCaseResult>,
    pub message_type: Option<String>,
    pub state_at_send: Option<String>,
    pub mutation_strategy: Option<String>,
    pub mutators_applied: Vec<String>,
    pub stage_name: Option<String>,
    pub context_snapshot: Option<serde_json::Value>,
    pub parsed_fields: Option<serde_json::Value>,
    pub connection_sequence: Option<i64>,
}

enum WriterMessage {
    Record(ExecutionRecord),
    Flush(oneshot::Sender<()>),
}

/// Sqlite-backed execution log with a memory ring and batched writes.
pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
    cache: Mutex<HashMap<String, VecDeque<ExecutionRecord>>>,
    cache_size: usize,
    /// Next positive sequence per session, primed from the database.
    sequences: tokio::sync::Mutex<HashMap<String, i64>>,
    /// Next negative sequence per session.
    bootstrap_sequences: Mutex<HashMap<String, i64>>,
    writer_tx: mpsc::UnboundedSender<WriterMessage>,
}

impl HistoryStore {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening history db {}", path.display()))?;
        Self::build(conn, path.display().to_string())
    }

    pub fn open_in_memory() -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory()?;
        Self::build(conn, ":memory:".into())
    }

    fn build(conn: Connection, label: String) -> Result<Arc<Self>> {
        Self::migrate(&conn)?;
        let conn = Arc::new(Mutex::new(conn));
        let (tx, rx) = mpsc::unbounded_channel();

        let store = Arc::new(Self {
            conn: conn.clone(),
            cache: Mutex::new(HashMap::new()),
            cache_size: DEFAULT_CACHE_SIZE,
            sequences: tokio::sync::Mutex::new(HashMap::new()),
            bootstrap_sequences: Mutex::new(HashMap::new()),
            writer_tx: tx,
        });

        tokio::spawn(background_writer(rx, conn));
        info!(db = %label, cache = DEFAULT_CACHE_SIZE, "history store opened");
        Ok(store)
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS executions (
                session_id TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                test_case_id TEXT,
                timestamp_sent TEXT NOT NULL,
                timestamp_response TEXT,
                duration_ms INTEGER,
                payload BLOB NOT NULL,
                payload_hash TEXT NOT NULL,
                response BLOB,
                protocol TEXT NOT NULL,
                message_type TEXT,
                state_at_send TEXT,
                result TEXT NOT NULL,
                mutation_strategy TEXT,
                mutators TEXT,
                PRIMARY KEY (session_id, sequence_number)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_timestamp
             ON executions (session_id, timestamp_sent)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_result
             ON executions (session_id, result)",
            [],
        )?;

        // Orchestration columns arrived later; additions are idempotent so
        // older databases open without migration scripts.
        for ddl in [
            "ALTER TABLE executions ADD COLUMN stage_name TEXT",
            "ALTER TABLE executions ADD COLUMN context_snapshot TEXT",
            "ALTER TABLE executions ADD COLUMN parsed_fields TEXT",
            "ALTER TABLE executions ADD COLUMN connection_sequence INTEGER",
        ] {
            if let Err(err) = conn.execute(ddl, []) {
                let msg = err.to_string();
                if !msg.contains("duplicate column") {
                    warn!(error = %msg, "history migration step failed");
                }
            }
        }
        Ok(())
    }

    /// Record a fuzz execution: assigns the next positive sequence, caches,
    /// and enqueues for the background writer.
    pub async fn record(&self, input: RecordInput) -> ExecutionRecord {
        let sequence = self.next_sequence(&input.session_id).await;
        let record = self.finish_record(input, sequence);
        self.push_cache(record.clone());
        self.enqueue(record.clone());
        record
    }

    /// Record a bootstrap/teardown execution under the next negative
    /// sequence number.
    pub async fn record_bootstrap(&self, input: RecordInput) -> ExecutionRecord {
        let sequence = {
            let mut map = self.bootstrap_sequences.lock();
            let next = map.entry(input.session_id.clone()).or_insert(0);
            *next -= 1;
            *next
        };
        let record = self.finish_record(input, sequence);
        self.push_cache(record.clone());
        self.enqueue(record.clone());
        record
    }

    fn finish_record(&self, input: RecordInput, sequence: i64) -> ExecutionRecord {
        let payload_hash = hex::encode(Sha256::digest(&input.payload));
        ExecutionRecord {
            session_id: input.session_id,
            sequence_number: sequence,
            test_case_id: input.test_case_id,
            timestamp_sent: input.timestamp_sent.unwrap_or_else(Utc::now),
            timestamp_response: input.timestamp_response,
            duration_ms: input.duration_ms,
            payload: input.payload,
            payload_hash,
            response: input.response,
            protocol: input.protocol,
            message_type: input.message_type,
            state_at_send: input.state_at_send,
            result: input.result.unwrap_or(TestCaseResult::Anomaly),
            mutation_strategy: input.mutation_strategy,
            mutators_applied: input.mutators_applied,
            stage_name: input.stage_name,
            context_snapshot: input.context_snapshot,
            parsed_fields: input.parsed_fields,
            connection_sequence: input.connection_sequence,
        }
    }

    async fn next_sequence(&self, session_id: &str) -> i64 {
        let mut sequences = self.sequences.lock().await;
        if let Some(current) = sequences.get_mut(session_id) {
            *current += 1;
            return *current;
        }
        // First use for this session: prime from the database.
        let max = self
            .query_max_sequence(session_id)
            .await
            .unwrap_or_default();
        let next = max + 1;
        sequences.insert(session_id.to_string(), next);
        next
    }

    async fn query_max_sequence(&self, session_id: &str) -> Result<i64> {
        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        let max = tokio::task::spawn_blocking(move || -> Result<i64> {
            let conn = conn.lock();
            let mut stmt = conn.prepare(
                "SELECT COALESCE(MAX(sequence_number), 0) FROM executions
                 WHERE session_id = ?1 AND sequence_number > 0",
            )?;
            Ok(stmt.query_row(params![session_id], |row| row.get(0))?)
        })
        .await??;
        Ok(max)
    }

    /// Drop session-local sequence tracking (used when a session's history
    /// is cleared).
    pub async fn reset_session(&self, session_id: &str) {
        self.sequences.lock().await.remove(session_id);
        self.bootstrap_sequences.lock().remove(session_id);
        self.cache.lock().remove(session_id);
    }

    fn push_cache(&self, record: ExecutionRecord) {
        let mut cache = self.cache.lock();
        let ring = cache
            .entry(record.session_id.clone())
            .or_insert_with(VecDeque::new);
        ring.push_back(record);
        while ring.len() > self.cache_size {
            ring.pop_front();
        }
    }

    fn enqueue(&self, record: ExecutionRecord) {
        if self.writer_tx.send(WriterMessage::Record(record)).is_err() {
            error!("history writer is gone, record dropped");
        }
    }

    /// Drain the write queue synchronously. Records still queued past the
    /// timeout are counted as lost.
    pub async fn flush(&self, timeout_ms: u64) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.writer_tx.send(WriterMessage::Flush(tx)).is_err() {
            return false;
        }
        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(())) => true,
            _ => {
                warn!(timeout_ms, "history flush timed out, queued records lost");
                false
            }
        }
    }

    /// Recent executions, descending by sequence. The first page merges the
    /// memory ring so records not yet flushed are visible; later pages are
    /// database-only.
    pub async fn list(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExecutionRecord>> {
        let mut rows = self
            .query_rows(session_id, limit, offset, since, until)
            .await?;

        if offset == 0 {
            let cached: Vec<ExecutionRecord> = {
                let cache = self.cache.lock();
                cache
                    .get(session_id)
                    .map(|ring| ring.iter().cloned().collect())
                    .unwrap_or_default()
            };
            let known: std::collections::HashSet<i64> =
                rows.iter().map(|r| r.sequence_number).collect();
            for record in cached {
                if known.contains(&record.sequence_number) {
                    continue;
                }
                if let Some(since) = since {
                    if record.timestamp_sent < since {
                        continue;
                    }
                }
                if let Some(until) = until {
                    if record.timestamp_sent > until {
                        continue;
                    }
                }
                rows.push(record);
            }
            rows.sort_by_key(|r| std::cmp::Reverse(r.sequence_number));
            rows.truncate(limit);
        }

        Ok(rows)
    }

    /// Ascending replay read: every row with `sequence_number <= up_to`.
    /// The only API whose order differs from [`list`](Self::list).
    pub async fn list_for_replay(
        &self,
        session_id: &str,
        up_to_sequence: i64,
    ) -> Result<Vec<ExecutionRecord>> {
        // Make sure everything enqueued so far is visible to the query.
        self.flush(5_000).await;

        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        let rows = tokio::task::spawn_blocking(move || -> Result<Vec<ExecutionRecord>> {
            let conn = conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM executions
                 WHERE session_id = ?1 AND sequence_number <= ?2
                 ORDER BY sequence_number ASC"
            ))?;
            let mapped = stmt.query_map(params![session_id, up_to_sequence], record_from_row)?;
            let mut out = Vec::new();
            for row in mapped {
                out.push(row?);
            }
            Ok(out)
        })
        .await??;
        Ok(rows)
    }

    pub async fn find_by_sequence(
        &self,
        session_id: &str,
        sequence: i64,
    ) -> Result<Option<ExecutionRecord>> {
        let conn = self.conn.clone();
        let sid = session_id.to_string();
        let row = tokio::task::spawn_blocking(move || -> Result<Option<ExecutionRecord>> {
            let conn = conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM executions
                 WHERE session_id = ?1 AND sequence_number = ?2"
            ))?;
            let mut rows = stmt.query(params![sid, sequence])?;
            match rows.next()? {
                Some(row) => Ok(Some(record_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await??;

        if row.is_some() {
            return Ok(row);
        }
        // Not yet flushed: check the ring.
        let cache = self.cache.lock();
        Ok(cache.get(session_id).and_then(|ring| {
            ring.iter()
                .find(|r| r.sequence_number == sequence)
                .cloned()
        }))
    }

    /// Latest execution at or before the given instant.
    pub async fn find_at_time(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>> {
        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        let row = tokio::task::spawn_blocking(move || -> Result<Option<ExecutionRecord>> {
            let conn = conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM executions
                 WHERE session_id = ?1 AND timestamp_sent <= ?2
                 ORDER BY timestamp_sent DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query(params![session_id, at.to_rfc3339()])?;
            match rows.next()? {
                Some(row) => Ok(Some(record_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await??;
        Ok(row)
    }

    /// Total fuzz executions recorded for a session. Trusts the in-memory
    /// counter while the session is active, else the database.
    pub async fn total_count(&self, session_id: &str) -> Result<i64> {
        if let Some(current) = self.sequences.lock().await.get(session_id) {
            return Ok(*current);
        }
        let db = self.query_max_sequence(session_id).await?;
        let cached = {
            let cache = self.cache.lock();
            cache
                .get(session_id)
                .and_then(|ring| {
                    ring.iter()
                        .map(|r| r.sequence_number)
                        .filter(|s| *s > 0)
                        .max()
                })
                .unwrap_or(0)
        };
        Ok(db.max(cached))
    }

    async fn query_rows(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        let since = since.map(|t| t.to_rfc3339());
        let until = until.map(|t| t.to_rfc3339());
        let rows = tokio::task::spawn_blocking(move || -> Result<Vec<ExecutionRecord>> {
            let conn = conn.lock();
            let mut sql = format!("SELECT {COLUMNS} FROM executions WHERE session_id = ?");
            let mut args: Vec<rusqlite::types::Value> = vec![session_id.into()];
            if let Some(since) = since {
                sql.push_str(" AND timestamp_sent >= ?");
                args.push(since.into());
            }
            if let Some(until) = until {
                sql.push_str(" AND timestamp_sent <= ?");
                args.push(until.into());
            }
            sql.push_str(" ORDER BY sequence_number DESC LIMIT ? OFFSET ?");
            args.push((limit as i64).into());
            args.push((offset as i64).into());

            let mut stmt = conn.prepare(&sql)?;
            let mapped = stmt.query_map(rusqlite::params_from_iter(args), record_from_row)?;
            let mut out = Vec::new();
            for row in mapped {
                out.push(row?);
            }
            Ok(out)
        })
        .await??;
        Ok(rows)
    }
}

const COLUMNS: &str = "session_id, sequence_number, test_case_id, timestamp_sent, \
     timestamp_response, duration_ms, payload, payload_hash, response, protocol, \
     message_type, state_at_send, result, mutation_strategy, mutators, stage_name, \
     context_snapshot, parsed_fields, connection_sequence";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let timestamp_sent: String = row.get(3)?;
    let timestamp_response: Option<String> = row.get(4)?;
    let result: String = row.get(12)?;
    let mutators: Option<String> = row.get(14)?;
    let context_snapshot: Option<String> = row.get(16)?;
    let parsed_fields: Option<String> = row.get(17)?;

    Ok(ExecutionRecord {
        session_id: row.get(0)?,
        sequence_number: row.get(1)?,
        test_case_id: row.get(2)?,
        timestamp_sent: parse_ts(&timestamp_sent),
        timestamp_response: timestamp_response.as_deref().map(parse_ts_str),
        duration_ms: row.get::<_, Option<i64>>(5)?.map(|d| d.max(0) as u64),
        payload: row.get(6)?,
        payload_hash: row.get(7)?,
        response: row.get(8)?,
        protocol: row.get(9)?,
        message_type: row.get(10)?,
        state_at_send: row.get(11)?,
        result: TestCaseResult::parse(&result).unwrap_or(TestCaseResult::Anomaly),
        mutation_strategy: row.get(13)?,
        mutators_applied: mutators
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        stage_name: row.get(15)?,
        context_snapshot: context_snapshot.and_then(|raw| serde_json::from_str(&raw).ok()),
        parsed_fields: parsed_fields.and_then(|raw| serde_json::from_str(&raw).ok()),
        connection_sequence: row.get(18)?,
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_str(raw: &str) -> DateTime<Utc> {
    parse_ts(raw)
}

async fn background_writer(
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
    conn: Arc<Mutex<Connection>>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::new();
        let mut flush_acks = Vec::new();
        match first {
            WriterMessage::Record(record) => batch.push(record),
            WriterMessage::Flush(ack) => flush_acks.push(ack),
        }
        // Opportunistically batch whatever else is already queued.
        while batch.len() < WRITE_BATCH_SIZE {
            match rx.try_recv() {
                Ok(WriterMessage::Record(record)) => batch.push(record),
                Ok(WriterMessage::Flush(ack)) => flush_acks.push(ack),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let conn = conn.clone();
            let count = batch.len();
            let outcome =
                tokio::task::spawn_blocking(move || write_batch(&conn, &batch)).await;
            match outcome {
                Ok(Ok(())) => debug!(count, "history batch written"),
                Ok(Err(err)) => error!(error = %err, count, "history batch write failed"),
                Err(err) => error!(error = %err, "history writer task join failed"),
            }
        }
        for ack in flush_acks {
            let _ = ack.send(());
        }
    }
    debug!("history writer stopped");
}

fn write_batch(conn: &Arc<Mutex<Connection>>, records: &[ExecutionRecord]) -> Result<()> {
    let mut conn = conn.lock();
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR REPLACE INTO executions (
                session_id, sequence_number, test_case_id, timestamp_sent,
                timestamp_response, duration_ms, payload, payload_hash, response,
                protocol, message_type, state_at_send, result, mutation_strategy,
                mutators, stage_name, context_snapshot, parsed_fields,
                connection_sequence
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                       ?15, ?16, ?17, ?18, ?19)",
        )?;
        for record in records {
            stmt.execute(params![
                record.session_id,
                record.sequence_number,
                record.test_case_id,
                record.timestamp_sent.to_rfc3339(),
                record.timestamp_response.map(|t| t.to_rfc3339()),
                record.duration_ms.map(|d| d as i64),
                record.payload,
                record.payload_hash,
                record.response,
                record.protocol,
                record.message_type,
                record.state_at_send,
                record.result.as_str(),
                record.mutation_strategy,
                serde_json::to_string(&record.mutators_applied)?,
                record.stage_name,
                record
                    .context_snapshot
                    .as_ref()
                    .map(|v| v.to_string()),
                record.parsed_fields.as_ref().map(|v| v.to_string()),
                record.connection_sequence,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(session: &str, payload: &[u8], result: TestCaseResult) -> RecordInput {
        RecordInput {
            session_id: session.to_string(),
            protocol: "simple_tcp".into(),
            payload: payload.to_vec(),
            result: Some(result),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sequences_are_strictly_increasing() {
        let store = HistoryStore::open_in_memory().unwrap();
        for i in 1..=5 {
            let record = store
                .record(input("s1", b"payload", TestCaseResult::Pass))
                .await;
            assert_eq!(record.sequence_number, i);
        }
        // Another session starts at 1 independently.
        let other = store.record(input("s2", b"x", TestCaseResult::Pass)).await;
        assert_eq!(other.sequence_number, 1);
    }

    #[tokio::test]
    async fn bootstrap_sequences_are_negative() {
        let store = HistoryStore::open_in_memory().unwrap();
        let first = store
            .record_bootstrap(input("s1", b"auth", TestCaseResult::Pass))
            .await;
        let second = store
            .record_bootstrap(input("s1", b"subscribe", TestCaseResult::Pass))
            .await;
        assert_eq!(first.sequence_number, -1);
        assert_eq!(second.sequence_number, -2);

        // Fuzz sequence numbers are unaffected.
        let fuzz = store.record(input("s1", b"f", TestCaseResult::Pass)).await;
        assert_eq!(fuzz.sequence_number, 1);
    }

    #[tokio::test]
    async fn list_is_descending_and_replay_ascending() {
        let store = HistoryStore::open_in_memory().unwrap();
        for i in 0u8..5 {
            store
                .record(input("s1", &[i], TestCaseResult::Pass))
                .await;
        }
        store.flush(2_000).await;

        let listed = store.list("s1", 10, 0, None, None).await.unwrap();
        let sequences: Vec<i64> = listed.iter().map(|r| r.sequence_number).collect();
        assert_eq!(sequences, vec![5, 4, 3, 2, 1]);

        let replay = store.list_for_replay("s1", 3).await.unwrap();
        let sequences: Vec<i64> = replay.iter().map(|r| r.sequence_number).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn first_page_sees_unflushed_records() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.record(input("s1", b"a", TestCaseResult::Pass)).await;
        // No flush: the record may only exist in the ring.
        let listed = store.list("s1", 10, 0, None, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].sequence_number, 1);
    }

    #[tokio::test]
    async fn find_by_sequence_and_count() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.record(input("s1", b"a", TestCaseResult::Pass)).await;
        store
            .record(input("s1", b"b", TestCaseResult::Crash))
            .await;
        store.flush(2_000).await;

        let found = store.find_by_sequence("s1", 2).await.unwrap().unwrap();
        assert_eq!(found.result, TestCaseResult::Crash);
        assert_eq!(found.payload, b"b");

        assert_eq!(store.total_count("s1").await.unwrap(), 2);
        assert_eq!(store.total_count("nope").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn payload_hash_and_previews() {
        let store = HistoryStore::open_in_memory().unwrap();
        let payload = vec![0xABu8; 200];
        let record = store
            .record(RecordInput {
                session_id: "s1".into(),
                protocol: "p".into(),
                payload: payload.clone(),
                response: Some(vec![0x01; 10]),
                result: Some(TestCaseResult::Pass),
                ..Default::default()
            })
            .await;
        assert_eq!(record.payload_preview().len(), 64);
        assert_eq!(record.response_preview().unwrap().len(), 10);
        assert_eq!(record.payload_hash, hex::encode(Sha256::digest(&payload)));

        let json = record.to_json();
        assert_eq!(json["payload_size"], 200);
        assert!(json["payload_preview"].as_str().unwrap().len() == 128);
    }

    #[tokio::test]
    async fn sequence_continues_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let store = HistoryStore::open(&path).unwrap();
            store.record(input("s1", b"a", TestCaseResult::Pass)).await;
            store.record(input("s1", b"b", TestCaseResult::Pass)).await;
            store.flush(2_000).await;
        }
        let store = HistoryStore::open(&path).unwrap();
        let record = store.record(input("s1", b"c", TestCaseResult::Pass)).await;
        assert_eq!(record.sequence_number, 3);
    }
}
