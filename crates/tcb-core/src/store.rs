//! Durable owner → record storage.
//!
//! `SqliteStore` is the production store: one row per owner, the record kept as
//! JSON so a row may carry only one of the two kinds. Every mutation is a single
//! autocommitted statement, so a crash loses at most the write in flight.
//! `MemoryStore` backs tests and throwaway runs.

use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    domain::{OwnerId, OwnerRecord},
    errors::Error,
    Result,
};

/// Storage port shared by the lifecycle manager and the sweeper.
///
/// Implementations never hold empty records: `put` of an empty record removes
/// the owner.
pub trait RecordStore: Send + Sync {
    fn get(&self, owner: OwnerId) -> Result<Option<OwnerRecord>>;
    fn put(&self, owner: OwnerId, record: &OwnerRecord) -> Result<()>;
    fn delete(&self, owner: OwnerId) -> Result<()>;
    fn list_owners(&self) -> Result<Vec<OwnerId>>;
}

/// Run one store operation on the blocking pool.
///
/// SQLite calls can sit in the busy timeout while another process holds the
/// write lock; that must not park a runtime worker.
pub async fn blocking<T, F>(store: &Arc<dyn RecordStore>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn RecordStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| Error::Task(format!("store task: {e}")))?
}

// ============== SQLite ==============

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS owner_records (
    owner_id INTEGER PRIMARY KEY,
    record TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // Admin subcommands may write while the daemon sweeps.
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StoreUnavailable("store connection lock poisoned".to_string()))
    }
}

fn owner_key(owner: OwnerId) -> Result<i64> {
    i64::try_from(owner.0)
        .map_err(|_| Error::StoreUnavailable(format!("owner id {owner} does not fit the store key")))
}

impl RecordStore for SqliteStore {
    fn get(&self, owner: OwnerId) -> Result<Option<OwnerRecord>> {
        let key = owner_key(owner)?;
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT record FROM owner_records WHERE owner_id = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let record: OwnerRecord =
            serde_json::from_str(&raw).map_err(|e| Error::StoreCorruption {
                owner,
                reason: e.to_string(),
            })?;
        Ok(Some(record))
    }

    fn put(&self, owner: OwnerId, record: &OwnerRecord) -> Result<()> {
        if record.is_empty() {
            return self.delete(owner);
        }
        let key = owner_key(owner)?;
        let json = serde_json::to_string(record)?;
        self.conn()?.execute(
            "INSERT INTO owner_records (owner_id, record, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(owner_id) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at",
            params![key, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn delete(&self, owner: OwnerId) -> Result<()> {
        let key = owner_key(owner)?;
        self.conn()?
            .execute("DELETE FROM owner_records WHERE owner_id = ?1", params![key])?;
        Ok(())
    }

    fn list_owners(&self) -> Result<Vec<OwnerId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT owner_id FROM owner_records ORDER BY owner_id")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut owners = Vec::with_capacity(keys.len());
        for key in keys {
            match u64::try_from(key) {
                Ok(id) => owners.push(OwnerId(id)),
                Err(_) => tracing::warn!(key, "skipping owner row with negative id"),
            }
        }
        Ok(owners)
    }
}

// ============== In-memory ==============

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<OwnerId, OwnerRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<OwnerId, OwnerRecord>>> {
        self.records
            .lock()
            .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, owner: OwnerId) -> Result<Option<OwnerRecord>> {
        Ok(self.records()?.get(&owner).cloned())
    }

    fn put(&self, owner: OwnerId, record: &OwnerRecord) -> Result<()> {
        let mut map = self.records()?;
        if record.is_empty() {
            map.remove(&owner);
        } else {
            map.insert(owner, record.clone());
        }
        Ok(())
    }

    fn delete(&self, owner: OwnerId) -> Result<()> {
        self.records()?.remove(&owner);
        Ok(())
    }

    fn list_owners(&self) -> Result<Vec<OwnerId>> {
        let mut owners: Vec<OwnerId> = self.records()?.keys().copied().collect();
        owners.sort();
        Ok(owners)
    }
}
