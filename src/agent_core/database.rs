//! SQLite session store.
//!
//! Uses `rusqlite` synchronously behind a mutex; calls are short and never
//! hold the lock across an await. WAL mode is enabled so readers do not block
//! a turn that is appending.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::conversation::{ConversationMessage, SessionStore};
use super::errors::AgentError;
use super::types::ToolOutcome;
use crate::inference::types::Role;

// ─── Types ──────────────────────────────────────────────────────────────────

/// Row from the sessions table.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: String,
    pub last_activity: String,
    pub message_count: usize,
}

// ─── Store ──────────────────────────────────────────────────────────────────

/// SQLite-backed [`SessionStore`].
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open (or create) the store at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        tracing::info!(path, "session store opened");
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                last_activity TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                visible_text TEXT,
                outcome_json TEXT,
                timestamp TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session
                ON messages(session_id, id);
            ",
        )?;
        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────────

    /// List sessions, most recent activity first.
    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>, AgentError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.created_at, s.last_activity,
                    (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
             FROM sessions s
             ORDER BY s.last_activity DESC, s.id",
        )?;

        let rows = stmt.query_map([], |row| {
            let count: i64 = row.get(3)?;
            Ok(SessionInfo {
                id: row.get(0)?,
                created_at: row.get(1)?,
                last_activity: row.get(2)?,
                message_count: usize::try_from(count).unwrap_or_default(),
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Delete a session and its messages.
    pub fn delete_session(&self, session_id: &str) -> Result<(), AgentError> {
        let conn = self.conn();
        conn.execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])?;
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        if deleted == 0 {
            return Err(AgentError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        Ok(())
    }

    /// Every tool outcome recorded for a session, oldest first.
    pub fn outcomes(&self, session_id: &str) -> Result<Vec<ToolOutcome>, AgentError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT outcome_json FROM messages
             WHERE session_id = ?1 AND outcome_json IS NOT NULL
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;

        let mut outcomes = Vec::new();
        for row in rows {
            outcomes.push(serde_json::from_str(&row?)?);
        }
        Ok(outcomes)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn append(&self, session_id: &str, messages: &[ConversationMessage]) -> Result<(), AgentError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO sessions (id) VALUES (?1)
             ON CONFLICT(id) DO UPDATE SET last_activity = datetime('now')",
            params![session_id],
        )?;

        for message in messages {
            let outcome_json = message
                .outcome
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO messages (session_id, role, content, visible_text, outcome_json, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session_id,
                    message.role.as_str(),
                    message.content,
                    message.visible_text,
                    outcome_json,
                    message.timestamp.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        tracing::debug!(session_id, appended = messages.len(), "messages persisted");
        Ok(())
    }

    async fn load_recent(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationMessage>, AgentError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT role, content, visible_text, outcome_json, timestamp FROM (
                 SELECT id, role, content, visible_text, outcome_json, timestamp
                 FROM messages WHERE session_id = ?1
                 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![session_id, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, content, visible_text, outcome_json, timestamp) = row?;
            let role = Role::parse(&role).ok_or_else(|| AgentError::DatabaseError {
                reason: format!("unknown role '{role}' in session {session_id}"),
            })?;
            let outcome = outcome_json
                .map(|json| serde_json::from_str::<ToolOutcome>(&json))
                .transpose()?;
            messages.push(ConversationMessage {
                role,
                content,
                visible_text,
                outcome,
                timestamp: parse_timestamp(&timestamp),
            });
        }
        Ok(messages)
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ─── Tests ──────────────────────────────────────────────────────────────────
