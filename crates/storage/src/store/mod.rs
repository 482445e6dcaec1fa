#![forbid(unsafe_code)]

mod error;
mod jobs;
mod queue;
mod support;
mod types;

pub use error::StoreError;
pub use types::*;

use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use support::migrate_sqlite_schema;

pub const DB_FILE_NAME: &str = "cx_jobs.db";

/// Millisecond wall clock; injectable so lease expiry can be exercised in tests.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
    clock: Clock,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("storage_dir", &self.storage_dir)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_clock(storage_dir, Arc::new(system_now_ms))
    }

    pub fn open_with_clock(storage_dir: impl AsRef<Path>, clock: Clock) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let db_path = storage_dir.join(DB_FILE_NAME);
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        migrate_sqlite_schema(&conn)?;
        tracing::debug!(dir = %storage_dir.display(), "opened job store");

        Ok(Self {
            conn,
            storage_dir,
            clock,
        })
    }

    /// How long a write waits on a competing writer before failing as busy.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), StoreError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn now_ms(&self) -> i64 {
        (self.clock)()
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            code.code == ErrorCode::ConstraintViolation
                || message.as_deref().is_some_and(|value| {
                    value.contains("UNIQUE constraint failed")
                        || value.contains("PRIMARY KEY constraint failed")
                })
        }
        _ => false,
    }
}

fn constraint_message(err: &rusqlite::Error) -> Option<&str> {
    match err {
        rusqlite::Error::SqliteFailure(_, message) => message.as_deref(),
        _ => None,
    }
}

fn to_sqlite_i64(value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("value exceeds sqlite range"))
}

fn ttl_deadline(now_ms: i64, ttl_ms: u64) -> i64 {
    now_ms.saturating_add(ttl_ms.min(i64::MAX as u64) as i64)
}

fn system_now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}
