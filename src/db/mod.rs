pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

use crate::project::ProjectStatus;
use crate::segments::{AudioStatus, SegmentError};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Stored JSON is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No project with id {0}")]
    ProjectNotFound(String),
    #[error("Unknown status '{0}' in database")]
    BadStatus(String),
    #[error("Project is {from}; cannot move to {to}")]
    InvalidStatus { from: ProjectStatus, to: ProjectStatus },
    #[error(transparent)]
    Segment(#[from] SegmentError),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL mode so render workers can read while a plan is being written
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.busy_timeout(std::time::Duration::from_secs(5))?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema v{version} is newer than this build (v{SCHEMA_VERSION})"
            )));
        }
        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: analyses, projects and their plans
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS analyses (
                track_id        TEXT PRIMARY KEY,
                source_path     TEXT,

                -- Summary columns for listing; the JSON is authoritative
                duration_ms     INTEGER NOT NULL,
                bpm             REAL NOT NULL,
                camelot         TEXT,
                energy          REAL NOT NULL,
                analysis_json   TEXT NOT NULL,

                imported_at     TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_analyses_bpm ON analyses(bpm);
            CREATE INDEX IF NOT EXISTS idx_analyses_camelot ON analyses(camelot);

            CREATE TABLE IF NOT EXISTS projects (
                id                  TEXT PRIMARY KEY,
                name                TEXT NOT NULL,
                status              TEXT NOT NULL DEFAULT 'created',
                plan_version        INTEGER NOT NULL DEFAULT 0,
                ordering_json       TEXT,
                average_mix_score   REAL,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS project_tracks (
                project_id  TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                track_id    TEXT NOT NULL,
                added_index INTEGER NOT NULL,
                PRIMARY KEY (project_id, track_id)
            );

            CREATE TABLE IF NOT EXISTS transitions (
                id                  TEXT NOT NULL,
                project_id          TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                position            INTEGER NOT NULL,
                from_track_id       TEXT NOT NULL,
                to_track_id         TEXT NOT NULL,
                phase               TEXT NOT NULL,

                score               INTEGER NOT NULL,
                harmonic_score      REAL NOT NULL,
                bpm_score           REAL NOT NULL,
                energy_score        REAL NOT NULL,
                compatibility_type  TEXT NOT NULL,
                bpm_difference      REAL NOT NULL,
                energy_difference   REAL NOT NULL,

                transition_type     TEXT NOT NULL,
                duration_bars       INTEGER NOT NULL,
                track_a_cut_ms      INTEGER NOT NULL,
                track_b_start_ms    INTEGER NOT NULL,
                plan_json           TEXT NOT NULL,
                plan_source         TEXT NOT NULL,
                UNIQUE (project_id, position)
            );

            CREATE TABLE IF NOT EXISTS segments (
                -- Segment IDs are only unique within a project
                id                  TEXT NOT NULL,
                project_id          TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                position            INTEGER NOT NULL,
                kind                TEXT NOT NULL,
                spec_json           TEXT NOT NULL,

                status              TEXT NOT NULL DEFAULT 'pending',
                audio_file_path     TEXT,
                audio_duration_ms   INTEGER,
                error               TEXT,
                attempts            INTEGER NOT NULL DEFAULT 0,
                cancelled           INTEGER NOT NULL DEFAULT 0,

                created_at          TEXT NOT NULL,
                claimed_at          TEXT,
                finished_at         TEXT,
                PRIMARY KEY (project_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_segments_project ON segments(project_id);
            CREATE INDEX IF NOT EXISTS idx_segments_status ON segments(status);
            ",
        )?;
        Ok(())
    }

    /// V2: one live segment per position; superseded rows are kept for
    /// discarding late callbacks
    fn migrate_v2(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE UNIQUE INDEX IF NOT EXISTS idx_segments_live
                ON segments(project_id, position) WHERE cancelled = 0;
            ",
        )?;
        Ok(())
    }
}

const SCHEMA_VERSION: i32 = 2;

pub(crate) fn parse_status(raw: &str) -> Result<AudioStatus> {
    AudioStatus::parse(raw).ok_or_else(|| DbError::BadStatus(raw.to_string()))
}

pub(crate) fn parse_project_status(raw: &str) -> Result<ProjectStatus> {
    ProjectStatus::parse(raw).ok_or_else(|| DbError::BadStatus(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let version: i32 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_rejects_newer_schema() {
        let db = Database::open_in_memory().unwrap();
        db.conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(db.migrate(), Err(DbError::Migration(_))));
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("segue.db");
        Database::open(&path).unwrap();
        assert!(path.exists());
        // reopening runs no migrations twice
        Database::open(&path).unwrap();
    }
}
