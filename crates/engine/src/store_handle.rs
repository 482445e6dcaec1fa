#![forbid(unsafe_code)]

use crate::error::EngineError;
use cx_storage::{SqliteStore, StoreError};
use std::sync::{Arc, Mutex};

/// Shared access to the synchronous store from async tasks.
///
/// Every call runs on tokio's blocking pool while holding the connection
/// mutex, so store operations from one process are serialized.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<SqliteStore>>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}

impl StoreHandle {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn call<T, F>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut SqliteStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().map_err(|_| StoreError::Poisoned)?;
            op(&mut guard)
        })
        .await
        .map_err(|err| EngineError::Join(err.to_string()))?;
        Ok(joined?)
    }
}
