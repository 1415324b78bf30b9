// ABOUTME: SQLite persistence for session metadata, channel bindings, and transcripts.
// ABOUTME: Single connection behind a mutex; schema created idempotently at open.

use crate::bus::ChannelBinding;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Default row count for `!read` when no count is given.
pub const DEFAULT_TRANSCRIPT_TAIL: usize = 10;

/// A logical session as registered in the store.
///
/// `session_id` is the backend's id for the conversation; it is absent
/// until the first prompt creates one and is rewritten whenever the
/// backend reports a new id, so restarts can resume where they left off.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub name: String,
    pub session_id: Option<String>,
    pub workspace: String,
    pub backend_type: Option<String>,
    pub created_at: String,
}

/// One logged message in a session's transcript.
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub session_name: String,
    pub sender: String,
    pub body: String,
    pub created_at: String,
}

/// Durable store for everything the routing core must remember across
/// restarts. Writes happen after the corresponding in-memory mutation, so
/// a crash between the two loses at most one update.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Mutex<Connection>>,
    workspace_root: PathBuf,
}

impl SessionStore {
    pub fn new<P: AsRef<Path>>(workspace_root: P) -> Result<Self> {
        let workspace_root = workspace_root.as_ref().to_path_buf();
        std::fs::create_dir_all(&workspace_root).context("failed to create workspace root")?;

        let db_path = workspace_root.join("crossbar.db");
        let conn = Connection::open(&db_path).context("failed to open crossbar database")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                name TEXT PRIMARY KEY,
                session_id TEXT,
                workspace TEXT NOT NULL,
                backend_type TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS bindings (
                platform_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                session_name TEXT NOT NULL,
                bound_at TEXT NOT NULL,
                PRIMARY KEY (platform_id, channel_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS transcript (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_name TEXT NOT NULL,
                sender TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            workspace_root,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Default workspace directory for a session name.
    pub fn default_workspace(&self, name: &str) -> PathBuf {
        self.workspace_root.join(name)
    }

    pub fn get_session(&self, name: &str) -> Result<Option<SessionRecord>> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let record = db
            .query_row(
                "SELECT name, session_id, workspace, backend_type, created_at
                 FROM sessions WHERE name = ?1",
                params![name],
                row_to_session,
            )
            .optional()
            .context("failed to query session")?;
        Ok(record)
    }

    /// Register a session. Fails when the name is already taken; also
    /// creates the workspace directory so backends can start in it.
    pub fn create_session(
        &self,
        name: &str,
        workspace: &str,
        backend_type: Option<&str>,
    ) -> Result<SessionRecord> {
        std::fs::create_dir_all(workspace)
            .with_context(|| format!("failed to create workspace {workspace}"))?;

        let created_at = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let inserted = db
            .execute(
                "INSERT OR IGNORE INTO sessions (name, session_id, workspace, backend_type, created_at)
                 VALUES (?1, NULL, ?2, ?3, ?4)",
                params![name, workspace, backend_type, created_at],
            )
            .context("failed to insert session")?;
        if inserted == 0 {
            anyhow::bail!("session '{name}' already exists");
        }

        Ok(SessionRecord {
            name: name.to_string(),
            session_id: None,
            workspace: workspace.to_string(),
            backend_type: backend_type.map(|s| s.to_string()),
            created_at,
        })
    }

    /// Fetch a session, materializing it under the default workspace when
    /// absent. Returns the record plus whether it was created just now.
    pub fn get_or_create_session(&self, name: &str) -> Result<(SessionRecord, bool)> {
        if let Some(record) = self.get_session(name)? {
            return Ok((record, false));
        }
        let workspace = self.default_workspace(name);
        let record = self.create_session(name, &workspace.to_string_lossy(), None)?;
        Ok((record, true))
    }

    pub fn update_session_id(&self, name: &str, session_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        db.execute(
            "UPDATE sessions SET session_id = ?2 WHERE name = ?1",
            params![name, session_id],
        )
        .context("failed to update session id")?;
        Ok(())
    }

    /// Forget the backend id after an orphaned session, forcing the next
    /// use to start fresh.
    pub fn clear_session_id(&self, name: &str) -> Result<()> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        db.execute(
            "UPDATE sessions SET session_id = NULL WHERE name = ?1",
            params![name],
        )
        .context("failed to clear session id")?;
        Ok(())
    }

    /// Delete a session and everything hanging off it: bindings and
    /// transcript rows go in the same call.
    pub fn delete_session(&self, name: &str) -> Result<bool> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        db.execute(
            "DELETE FROM bindings WHERE session_name = ?1",
            params![name],
        )?;
        db.execute(
            "DELETE FROM transcript WHERE session_name = ?1",
            params![name],
        )?;
        let deleted = db.execute("DELETE FROM sessions WHERE name = ?1", params![name])?;
        Ok(deleted > 0)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = db.prepare(
            "SELECT name, session_id, workspace, backend_type, created_at
             FROM sessions ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to list sessions")?;
        Ok(rows)
    }

    pub fn bind_channel(&self, platform_id: &str, channel_id: &str, session_name: &str) -> Result<()> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        db.execute(
            "INSERT OR REPLACE INTO bindings (platform_id, channel_id, session_name, bound_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![platform_id, channel_id, session_name, Utc::now().to_rfc3339()],
        )
        .context("failed to persist binding")?;
        Ok(())
    }

    pub fn unbind_channel(&self, platform_id: &str, channel_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let deleted = db.execute(
            "DELETE FROM bindings WHERE platform_id = ?1 AND channel_id = ?2",
            params![platform_id, channel_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn unbind_session(&self, session_name: &str) -> Result<usize> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let deleted = db.execute(
            "DELETE FROM bindings WHERE session_name = ?1",
            params![session_name],
        )?;
        Ok(deleted)
    }

    pub fn load_bindings(&self) -> Result<Vec<ChannelBinding>> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = db.prepare(
            "SELECT platform_id, channel_id, session_name, bound_at FROM bindings",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let bound_at: String = row.get(3)?;
                Ok(ChannelBinding {
                    platform_id: row.get(0)?,
                    channel_id: row.get(1)?,
                    session_name: row.get(2)?,
                    bound_at: parse_timestamp(&bound_at),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to load bindings")?;
        Ok(rows)
    }

    pub fn append_transcript(&self, session_name: &str, sender: &str, body: &str) -> Result<()> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        db.execute(
            "INSERT INTO transcript (session_name, sender, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_name, sender, body, Utc::now().to_rfc3339()],
        )
        .context("failed to append transcript")?;
        Ok(())
    }

    /// Last `count` transcript entries for a session, oldest first.
    pub fn tail_transcript(&self, session_name: &str, count: usize) -> Result<Vec<TranscriptEntry>> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = db.prepare(
            "SELECT session_name, sender, body, created_at FROM transcript
             WHERE session_name = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![session_name, count as i64], |row| {
                Ok(TranscriptEntry {
                    session_name: row.get(0)?,
                    sender: row.get(1)?,
                    body: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read transcript")?;
        rows.reverse();
        Ok(rows)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        name: row.get(0)?,
        session_id: row.get(1)?,
        workspace: row.get(2)?,
        backend_type: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
