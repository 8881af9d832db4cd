//! Key/Value Store
//!
//! SQLite-Datenbank für lokale Einstellungen und den Namens-Cache.
//! Für Tests gibt es eine In-Memory-Variante mit identischem Verhalten.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Failed to encode value: {0}")]
    Encoding(#[from] serde_json::Error),
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Minimaler Key/Value-Vertrag für lokale Persistenz
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Alle Keys mit dem gegebenen Präfix, aufsteigend sortiert
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// SQLite-basierter Store (Thread-safe durch Mutex)
pub struct SqliteKeyValueStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyValueStore {
    /// Öffnet oder erstellt die Datenbank im App-Datenverzeichnis
    pub fn open() -> Result<Self, StoreError> {
        let db_path = Self::get_database_path()?;
        Self::open_at(&db_path)
    }

    /// Öffnet oder erstellt die Datenbank unter einem festen Pfad
    pub fn open_at(db_path: &Path) -> Result<Self, StoreError> {
        // Parent-Verzeichnis erstellen
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening key/value store at {:?}", db_path);

        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// In-Memory Datenbank
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Ermittelt den Pfad zur Datenbank-Datei
    fn get_database_path() -> Result<PathBuf, StoreError> {
        let proj_dirs = directories::ProjectDirs::from("com", "roomcall", "roomcall")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("store.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;
        Ok(())
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO kv (key, value)
            VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = datetime('now')
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key ASC")?;
        // '%' und '_' im Präfix sind keine LIKE-Muster
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<SqliteResult<Vec<String>>>()?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect();
        Ok(keys)
    }
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// Flüchtiger Store für Tests und Gastmodus
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KeyValueStore) {
        store.set("p2p_chat_user_b", "Bob").unwrap();
        store.set("p2p_chat_user_a", "Alice").unwrap();
        store.set("p2p_chat_username", "Me").unwrap();

        assert_eq!(store.get("p2p_chat_user_a").unwrap().as_deref(), Some("Alice"));
        assert_eq!(
            store.list_keys("p2p_chat_user_").unwrap(),
            vec!["p2p_chat_user_a".to_string(), "p2p_chat_user_b".to_string()]
        );

        store.set("p2p_chat_user_a", "Alicia").unwrap();
        assert_eq!(store.get("p2p_chat_user_a").unwrap().as_deref(), Some("Alicia"));

        store.remove("p2p_chat_user_a").unwrap();
        assert_eq!(store.get("p2p_chat_user_a").unwrap(), None);
        assert_eq!(store.list_keys("p2p_chat_user_").unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryKeyValueStore::new());
    }

    #[test]
    fn test_sqlite_store_in_memory() {
        exercise(&SqliteKeyValueStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");

        {
            let store = SqliteKeyValueStore::open_at(&path).unwrap();
            store.set("p2p_chat_username", "Alice").unwrap();
        }

        let store = SqliteKeyValueStore::open_at(&path).unwrap();
        assert_eq!(store.get("p2p_chat_username").unwrap().as_deref(), Some("Alice"));
    }
}
