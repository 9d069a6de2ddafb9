//! SQLite persistence for transfer state
//!
//! Lets the daemon tell, after a restart, which transfers were cut short.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use super::{TransferId, TransferInfo, TransferState};

/// Database error types
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Invalid transfer state: {0}")]
    InvalidState(String),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Database handle for transfer persistence
pub struct TransferStore {
    conn: Connection,
}

impl TransferStore {
    /// Open or create a database at the specified path
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DatabaseError::CreateDir)?;
        }

        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), DatabaseError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id TEXT PRIMARY KEY,
                friend TEXT NOT NULL,
                filename TEXT NOT NULL,
                destination TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                bytes_received INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                cause TEXT
            );
            "#,
        )?;
        Ok(())
    }

    pub fn insert_transfer(&self, transfer: &TransferInfo) -> Result<(), DatabaseError> {
        self.conn.execute(
            r#"
            INSERT INTO transfers (id, friend, filename, destination, state, bytes_received, started_at, finished_at, cause)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                transfer.id.to_string(),
                transfer.friend,
                transfer.filename,
                transfer.destination.to_string_lossy(),
                state_to_string(transfer.state),
                transfer.bytes_received as i64,
                transfer.started_at.to_rfc3339(),
                transfer.finished_at.map(|t| t.to_rfc3339()),
                transfer.cause,
            ],
        )?;
        Ok(())
    }

    /// Write the mutable part of a transfer back
    pub fn update_transfer(&self, transfer: &TransferInfo) -> Result<(), DatabaseError> {
        self.conn.execute(
            r#"
            UPDATE transfers
            SET state = ?1, bytes_received = ?2, finished_at = ?3, cause = ?4
            WHERE id = ?5
            "#,
            params![
                state_to_string(transfer.state),
                transfer.bytes_received as i64,
                transfer.finished_at.map(|t| t.to_rfc3339()),
                transfer.cause,
                transfer.id.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_transfer(&self, id: TransferId) -> Result<(), DatabaseError> {
        self.conn
            .execute("DELETE FROM transfers WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    pub fn get_transfer(&self, id: TransferId) -> Result<Option<TransferInfo>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, friend, filename, destination, state, bytes_received, started_at, finished_at, cause
            FROM transfers
            WHERE id = ?1
            "#,
        )?;

        let row_data: Option<TransferRowData> = stmt
            .query_row(params![id.to_string()], TransferRowData::from_row)
            .optional()?;

        row_data.map(TransferRowData::into_transfer_info).transpose()
    }

    /// List transfers, oldest first
    pub fn list_transfers(&self) -> Result<Vec<TransferInfo>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, friend, filename, destination, state, bytes_received, started_at, finished_at, cause
            FROM transfers
            ORDER BY started_at ASC
            "#,
        )?;

        let mut rows = stmt.query([])?;
        let mut transfers = Vec::new();
        while let Some(row) = rows.next()? {
            transfers.push(TransferRowData::from_row(row)?.into_transfer_info()?);
        }
        Ok(transfers)
    }
}

/// Raw row data, converted outside rusqlite's error type
struct TransferRowData {
    id: String,
    friend: String,
    filename: String,
    destination: String,
    state: String,
    bytes_received: i64,
    started_at: String,
    finished_at: Option<String>,
    cause: Option<String>,
}

impl TransferRowData {
    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            friend: row.get(1)?,
            filename: row.get(2)?,
            destination: row.get(3)?,
            state: row.get(4)?,
            bytes_received: row.get(5)?,
            started_at: row.get(6)?,
            finished_at: row.get(7)?,
            cause: row.get(8)?,
        })
    }

    fn into_transfer_info(self) -> Result<TransferInfo, DatabaseError> {
        let id: TransferId = self.id.parse()?;
        let started_at = parse_timestamp(&self.started_at)?;
        let finished_at = self.finished_at.as_deref().map(parse_timestamp).transpose()?;

        Ok(TransferInfo {
            id,
            friend: self.friend,
            filename: self.filename,
            destination: PathBuf::from(self.destination),
            state: state_from_string(&self.state)?,
            bytes_received: self.bytes_received.max(0) as u64,
            started_at,
            finished_at,
            cause: self.cause,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<chrono::DateTime<chrono::Utc>, DatabaseError> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| DatabaseError::InvalidTimestamp(e.to_string()))
}

fn state_to_string(state: TransferState) -> &'static str {
    match state {
        TransferState::Pending => "pending",
        TransferState::Transferring => "transferring",
        TransferState::Complete => "complete",
        TransferState::Failed => "failed",
    }
}

fn state_from_string(s: &str) -> Result<TransferState, DatabaseError> {
    match s {
        "pending" => Ok(TransferState::Pending),
        "transferring" => Ok(TransferState::Transferring),
        "complete" => Ok(TransferState::Complete),
        "failed" => Ok(TransferState::Failed),
        other => Err(DatabaseError::InvalidState(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(id: TransferId) -> TransferInfo {
        TransferInfo {
            id,
            friend: "alice".to_string(),
            filename: "Movies/Alien.avi".to_string(),
            destination: PathBuf::from("/incoming/Movies/Alien.avi"),
            state: TransferState::Pending,
            bytes_received: 0,
            started_at: chrono::Utc::now(),
            finished_at: None,
            cause: None,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = TransferStore::open_in_memory().unwrap();
        let id = TransferId::new();
        store.insert_transfer(&sample(id)).unwrap();

        let loaded = store.get_transfer(id).unwrap().unwrap();
        assert_eq!(loaded.friend, "alice");
        assert_eq!(loaded.filename, "Movies/Alien.avi");
        assert_eq!(loaded.state, TransferState::Pending);
        assert!(loaded.finished_at.is_none());
    }

    #[test]
    fn test_get_missing() {
        let store = TransferStore::open_in_memory().unwrap();
        assert!(store.get_transfer(TransferId::new()).unwrap().is_none());
    }

    #[test]
    fn test_update() {
        let store = TransferStore::open_in_memory().unwrap();
        let id = TransferId::new();
        let mut transfer = sample(id);
        store.insert_transfer(&transfer).unwrap();

        transfer.state = TransferState::Failed;
        transfer.bytes_received = 42;
        transfer.finished_at = Some(chrono::Utc::now());
        transfer.cause = Some("disk full".to_string());
        store.update_transfer(&transfer).unwrap();

        let loaded = store.get_transfer(id).unwrap().unwrap();
        assert_eq!(loaded.state, TransferState::Failed);
        assert_eq!(loaded.bytes_received, 42);
        assert!(loaded.finished_at.is_some());
        assert_eq!(loaded.cause.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_list_and_delete() {
        let store = TransferStore::open_in_memory().unwrap();
        let first = TransferId::new();
        let second = TransferId::new();
        let mut older = sample(first);
        older.started_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        store.insert_transfer(&older).unwrap();
        store.insert_transfer(&sample(second)).unwrap();

        let listed = store.list_transfers().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first);

        store.delete_transfer(first).unwrap();
        assert_eq!(store.list_transfers().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_state() {
        assert!(matches!(
            state_from_string("paused"),
            Err(DatabaseError::InvalidState(_))
        ));
    }

    #[test]
    fn test_open_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a").join("b").join("state.db");
        TransferStore::open(&path).unwrap();
        assert!(path.exists());
    }
}
