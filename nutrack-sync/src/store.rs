//! Local database seam
//!
//! The engine treats the database as an opaque file for hashing and
//! transfer. The one query it runs itself is the retention cleanup.

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{Error, Result};

/// Local single-file database
pub trait LocalStore: Send + Sync {
    /// Path of the database file
    fn path(&self) -> &Path;

    /// Delete consumption records dated strictly before `cutoff`.
    /// Returns the number of rows removed.
    fn delete_consumed_before(&self, cutoff: NaiveDate) -> Result<u64>;
}

/// SQLite database file, opened transiently per call
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.path).map_err(store_error)
    }
}

impl LocalStore for SqliteStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn delete_consumed_before(&self, cutoff: NaiveDate) -> Result<u64> {
        let conn = self.connect()?;
        let cutoff = cutoff.format("%Y-%m-%d").to_string();

        let deleted = conn
            .execute("DELETE FROM consumedFoodItems WHERE date < ?1", params![cutoff])
            .map_err(store_error)?;

        debug!("Deleted {} consumed food items older than {}", deleted, cutoff);
        Ok(deleted as u64)
    }
}

fn store_error(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded(dir: &TempDir) -> SqliteStore {
        let path = dir.path().join("nutrack.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE consumedFoodItems (id INTEGER PRIMARY KEY, date TEXT NOT NULL);
             INSERT INTO consumedFoodItems (date) VALUES
                ('2024-01-01'), ('2024-03-31'), ('2024-04-01'), ('2024-06-15');",
        )
        .unwrap();
        SqliteStore::new(path)
    }

    fn remaining(store: &SqliteStore) -> Vec<String> {
        let conn = Connection::open(store.path()).unwrap();
        let mut stmt = conn
            .prepare("SELECT date FROM consumedFoodItems ORDER BY date")
            .unwrap();
        let rows = stmt.query_map([], |row| row.get(0)).unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_deletes_strictly_before_cutoff() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir);

        let cutoff = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        assert_eq!(store.delete_consumed_before(cutoff).unwrap(), 2);
        assert_eq!(remaining(&store), vec!["2024-04-01", "2024-06-15"]);

        assert_eq!(store.delete_consumed_before(cutoff).unwrap(), 0);
    }

    #[test]
    fn test_missing_table_is_store_error() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("empty.db"));

        let err = store
            .delete_consumed_before(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
            .unwrap_err();
        assert_eq!(err.code(), "STORE_ERROR");
    }
}
