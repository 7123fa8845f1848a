//! # Session Persistence
//!
//! Sqlite-backed session store. Each session is one row: a JSON blob of the
//! full object plus indexed scalar columns for the queries the control
//! plane actually runs (status, protocol, target, creation time). Column
//! additions are idempotent so databases written by older binaries open on
//! newer ones without a migration step.
//!
//! All sqlite work runs on the blocking thread pool; the async methods
//! never stall the reactor.

use super::{Session, SessionStatus};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Durable store for sessions.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Open (and lazily create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening session db {}", path.display()))?;
        Self::migrate(&conn)?;
        info!(db = %path.display(), "session store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                protocol TEXT NOT NULL,
                target TEXT NOT NULL,
                created_at TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions (status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_protocol ON sessions (protocol)",
            [],
        )?;

        // Idempotent column additions for older databases.
        for ddl in ["ALTER TABLE sessions ADD COLUMN target TEXT DEFAULT ''"] {
            if let Err(err) = conn.execute(ddl, []) {
                let msg = err.to_string();
                if !msg.contains("duplicate column") {
                    debug!(error = %msg, "migration step skipped");
                }
            }
        }
        Ok(())
    }

    /// Insert or replace a session row.
    pub async fn save(&self, session: Session) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let data = serde_json::to_string(&session)?;
            conn.lock().execute(
                "INSERT OR REPLACE INTO sessions (id, status, protocol, target, created_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session.id,
                    session.status.as_str(),
                    session.config.protocol,
                    session.config.target_addr(),
                    session.created_at.to_rfc3339(),
                    data,
                ],
            )?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        let row = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = conn.lock();
            let mut stmt = conn.prepare("SELECT data FROM sessions WHERE id = ?1")?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                None => Ok(None),
            }
        })
        .await??;

        match row {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        let deleted = tokio::task::spawn_blocking(move || -> Result<usize> {
            Ok(conn.lock().execute("DELETE FROM sessions WHERE id = ?1", params![id])?)
        })
        .await??;
        Ok(deleted > 0)
    }

    /// All sessions, newest first.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let conn = self.conn.clone();
        let raws = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = conn.lock();
            let mut stmt =
                conn.prepare("SELECT data FROM sessions ORDER BY created_at DESC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await??;

        let mut sessions = Vec::with_capacity(raws.len());
        for raw in raws {
            match serde_json::from_str::<Session>(&raw) {
                Ok(session) => sessions.push(session),
                Err(err) => warn!(error = %err, "skipping unreadable session row"),
            }
        }
        Ok(sessions)
    }

    /// Startup sweep: any session persisted as `running` did not survive
    /// the restart. Flip it to `paused` with an explanatory error.
    pub async fn pause_orphaned_running(&self) -> Result<usize> {
        let sessions = self.list().await?;
        let mut paused = 0;
        for mut session in sessions {
            if session.status != SessionStatus::Running {
                continue;
            }
            session.status = SessionStatus::Paused;
            session.append_error(
                "session was running when the process stopped; paused on restart",
            );
            self.save(session).await?;
            paused += 1;
        }
        if paused > 0 {
            info!(count = paused, "paused orphaned running sessions");
        }
        Ok(paused)
    }
}
