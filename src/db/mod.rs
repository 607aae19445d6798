pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StorageError, StorageResult};

/// SQLite connection with the offline schema applied.
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at `path`
  pub fn open(path: &Path) -> StorageResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let conn = Connection::open(path)?;
    // `run` and one-shot commands may share the file
    conn.busy_timeout(Duration::from_secs(5))?;
    // WAL keeps readers (status polling) from blocking the sync pass writer
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a private in-memory database. Nothing survives the process.
  pub fn open_in_memory() -> StorageResult<Self> {
    let db = Self {
      conn: Connection::open_in_memory()?,
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> StorageResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        StorageError::Io(std::io::Error::new(
          std::io::ErrorKind::NotFound,
          "could not determine data directory",
        ))
      })?;

    Ok(data_dir.join("shopsync").join("offline.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> StorageResult<()> {
    self.conn.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  pub fn into_connection(self) -> Connection {
    self.conn
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_open_creates_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("offline.db");

    Database::open(&path).unwrap();
    assert!(path.exists());
  }

  #[test]
  fn test_migrations_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    Database::open(&path).unwrap();
    Database::open(&path).unwrap();
  }
}
