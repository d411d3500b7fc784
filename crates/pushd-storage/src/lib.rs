use chrono::Utc;
use pushd_core::ledger::{AttachmentStore, LedgerError};
use pushd_core::ConnectionId;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub const LEDGER_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        LedgerError::Backend(err.to_string())
    }
}

/// SQLite-backed ledger attachments, keyed by app and connection id.
pub struct LedgerStore {
    conn: Mutex<Connection>,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()?
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > LEDGER_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: LEDGER_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_ledger_schema.sql");
            let conn = self.conn()?;
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn save(
        &self,
        app_key: &str,
        conn_id: &ConnectionId,
        attachment: &[u8],
    ) -> Result<(), StorageError> {
        self.conn()?.execute(
            "
            INSERT INTO connection_ledgers (app_key, connection_id, attachment, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(app_key, connection_id) DO UPDATE SET
                attachment=excluded.attachment,
                updated_at=excluded.updated_at
            ",
            params![
                app_key,
                conn_id.as_str(),
                attachment,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn load(
        &self,
        app_key: &str,
        conn_id: &ConnectionId,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT attachment FROM connection_ledgers WHERE app_key = ?1 AND connection_id = ?2",
                params![app_key, conn_id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn remove(&self, app_key: &str, conn_id: &ConnectionId) -> Result<bool, StorageError> {
        let changes = self.conn()?.execute(
            "DELETE FROM connection_ledgers WHERE app_key = ?1 AND connection_id = ?2",
            params![app_key, conn_id.as_str()],
        )?;
        Ok(changes > 0)
    }

    pub fn clear_app(&self, app_key: &str) -> Result<usize, StorageError> {
        Ok(self.conn()?.execute(
            "DELETE FROM connection_ledgers WHERE app_key = ?1",
            params![app_key],
        )?)
    }

    pub fn connection_ids(&self, app_key: &str) -> Result<Vec<ConnectionId>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT connection_id FROM connection_ledgers WHERE app_key = ?1 ORDER BY connection_id",
        )?;
        let rows = stmt.query_map(params![app_key], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(ConnectionId::from(row?));
        }
        Ok(ids)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let found: Option<String> = self
            .conn()?
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Attachment store view limited to one app's rows.
    pub fn scoped(self: &Arc<Self>, app_key: &str) -> ScopedLedger {
        ScopedLedger {
            store: Arc::clone(self),
            app_key: app_key.to_string(),
        }
    }
}

pub struct ScopedLedger {
    store: Arc<LedgerStore>,
    app_key: String,
}

impl ScopedLedger {
    pub fn app_key(&self) -> &str {
        &self.app_key
    }
}

impl AttachmentStore for ScopedLedger {
    fn save(&self, conn_id: &ConnectionId, attachment: &[u8]) -> Result<(), LedgerError> {
        Ok(self.store.save(&self.app_key, conn_id, attachment)?)
    }

    fn load(&self, conn_id: &ConnectionId) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self.store.load(&self.app_key, conn_id)?)
    }

    fn remove(&self, conn_id: &ConnectionId) -> Result<(), LedgerError> {
        self.store.remove(&self.app_key, conn_id)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), LedgerError> {
        self.store.clear_app(&self.app_key)?;
        Ok(())
    }
}
