//! NVRAM persistence.
//!
//! One row per instance: the opaque NVRAM blob, its SHA-256 digest and the
//! time it was last written.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lparkit_shared::errors::{LparkitError, LparkitResult};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| LparkitError::Database(e.to_string()))
    };
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nvram (
    instance_uuid TEXT PRIMARY KEY NOT NULL,
    data TEXT NOT NULL,
    digest TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Stored NVRAM for one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct NvramRecord {
    pub data: String,
    pub digest: String,
    pub updated_at: DateTime<Utc>,
}

/// Backend the NVRAM manager persists blobs into.
pub trait NvramStore: Send + Sync {
    fn put(&self, instance_uuid: &Uuid, data: &str, digest: &str) -> LparkitResult<()>;

    fn get(&self, instance_uuid: &Uuid) -> LparkitResult<Option<NvramRecord>>;

    /// Returns true when a row was removed.
    fn delete(&self, instance_uuid: &Uuid) -> LparkitResult<bool>;
}

/// SQLite-backed [`NvramStore`].
#[derive(Clone)]
pub struct SqliteNvramStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteNvramStore {
    /// Open or create the database.
    pub fn open(db_path: &Path) -> LparkitResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;
        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA busy_timeout=100000;
            "
        ))?;
        db_err!(conn.execute_batch(SCHEMA))?;

        tracing::debug!(path = %db_path.display(), "Opened NVRAM store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

impl NvramStore for SqliteNvramStore {
    fn put(&self, instance_uuid: &Uuid, data: &str, digest: &str) -> LparkitResult<()> {
        let now = Utc::now().to_rfc3339();
        db_err!(self.conn().execute(
            "INSERT INTO nvram (instance_uuid, data, digest, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(instance_uuid) DO UPDATE SET
                data = excluded.data,
                digest = excluded.digest,
                updated_at = excluded.updated_at",
            rusqlite::params![instance_uuid.to_string(), data, digest, now],
        ))?;
        Ok(())
    }

    fn get(&self, instance_uuid: &Uuid) -> LparkitResult<Option<NvramRecord>> {
        let row: Option<(String, String, String)> = db_err!(
            self.conn()
                .query_row(
                    "SELECT data, digest, updated_at FROM nvram WHERE instance_uuid = ?1",
                    [instance_uuid.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
        )?;

        let Some((data, digest, updated_at)) = row else {
            return Ok(None);
        };
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| LparkitError::Database(format!("bad timestamp '{}': {}", updated_at, e)))?
            .with_timezone(&Utc);

        Ok(Some(NvramRecord {
            data,
            digest,
            updated_at,
        }))
    }

    fn delete(&self, instance_uuid: &Uuid) -> LparkitResult<bool> {
        let removed = db_err!(self.conn().execute(
            "DELETE FROM nvram WHERE instance_uuid = ?1",
            [instance_uuid.to_string()],
        ))?;
        Ok(removed > 0)
    }
}
