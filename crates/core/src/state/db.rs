//! # Foreman Database
//!
//! Single SQLite database for crash-durable pattern mining state:
//! tool-use observations, crystallization candidates, and approved skills.
//! Lives at `.foreman/foreman.db`.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::io::RuntimePaths;

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Shared database handle
pub struct ForemanDb {
    conn: Arc<Mutex<Connection>>,
}

impl ForemanDb {
    /// Open or create the database for a workspace
    pub fn open(paths: &RuntimePaths) -> Result<Self> {
        paths.ensure_runtime_dir()?;
        Self::open_at(paths.db_path())
    }

    /// Open database at a specific path (useful for testing)
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open foreman database")?;
        Self::from_connection(conn)
    }

    /// In-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a shared connection for use by other modules
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Run schema migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
            tracing::info!(version = SCHEMA_VERSION, "Foreman database initialized");
        }

        Ok(())
    }

    /// Migration to version 1 - complete schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        // Observations are insert-only; `quarantined` flips once
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                signature TEXT NOT NULL,
                tool_sequence TEXT NOT NULL,
                goal_summary TEXT NOT NULL DEFAULT '',
                outcome TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                quarantined INTEGER NOT NULL DEFAULT 1
            )
            "#,
            [],
        )?;

        // One aggregate row per tool-sequence signature
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS candidates (
                id TEXT PRIMARY KEY,
                tool_sequence TEXT NOT NULL,
                observation_count INTEGER NOT NULL,
                success_count INTEGER NOT NULL,
                success_rate REAL NOT NULL,
                distinct_sessions INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'candidate',
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                decided_at TEXT
            )
            "#,
            [],
        )?;

        // Skills handed over on approval
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS skills (
                name TEXT PRIMARY KEY,
                candidate_id TEXT NOT NULL,
                risk_tier INTEGER NOT NULL,
                descriptor TEXT NOT NULL,
                approved_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_observations_signature ON observations(signature, quarantined)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_candidates_status ON candidates(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_skills_expires ON skills(expires_at)",
            [],
        )?;

        Ok(())
    }
}
