//! Persistence store: SQLite-backed build records and the singleton active
//! process record, fronted by a bounded FIFO cache.
//!
//! All access goes through [`Store`], which holds the connection and the cache
//! behind one mutex and runs every call on tokio's blocking pool. An update
//! therefore writes storage and cache together; no reader can observe them
//! disagreeing.

pub mod cache;
pub mod db;

use std::path::Path;
use std::sync::Arc;

use buildmgr_common::{ActiveProcessRecord, BuildPatch, BuildRecord};

use crate::errors::StoreError;
use cache::BuildCache;
use db::BuildDb;

pub const CACHE_CAPACITY: usize = 100;

pub struct StoreInner {
    db: BuildDb,
    cache: BuildCache,
}

impl StoreInner {
    fn build(&mut self, id: &str) -> Result<BuildRecord, StoreError> {
        if let Some(record) = self.cache.get(id) {
            return Ok(record.clone());
        }
        let record = self
            .db
            .load_build(id)?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        self.cache.insert(record.clone());
        Ok(record)
    }
}

/// Async-safe, cloneable handle to the persistence store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<std::sync::Mutex<StoreInner>>,
}

impl Store {
    pub fn new(db: BuildDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(StoreInner {
                db,
                cache: BuildCache::new(CACHE_CAPACITY),
            })),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(BuildDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(BuildDb::new_in_memory()?))
    }

    /// Run a closure with exclusive access on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut StoreInner) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    pub async fn create_build_record(&self, id: &str) -> Result<BuildRecord, StoreError> {
        let id = id.to_string();
        self.call(move |inner| {
            let record = inner.db.insert_build(&id)?;
            inner.cache.insert(record.clone());
            Ok(record)
        })
        .await
    }

    pub async fn get_build_record(&self, id: &str) -> Result<BuildRecord, StoreError> {
        let id = id.to_string();
        self.call(move |inner| inner.build(&id)).await
    }

    /// Apply a patch to a record. The transition is checked against the
    /// record's current state; `created_time` is always preserved.
    pub async fn update_build_record(
        &self,
        id: &str,
        patch: BuildPatch,
    ) -> Result<BuildRecord, StoreError> {
        let id = id.to_string();
        self.call(move |inner| {
            let current = inner.build(&id)?;
            let state = current
                .state
                .apply(patch)
                .map_err(|source| StoreError::InvalidTransition {
                    id: id.clone(),
                    source,
                })?;
            let updated = BuildRecord { state, ..current };
            inner.db.write_build(&updated)?;
            inner.cache.insert(updated.clone());
            Ok(updated)
        })
        .await
    }

    pub async fn list_build_records(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BuildRecord>, StoreError> {
        self.call(move |inner| inner.db.list_builds(limit, offset)).await
    }

    pub async fn get_active_process_record(&self) -> Result<Option<ActiveProcessRecord>, StoreError> {
        self.call(|inner| inner.db.get_process()).await
    }

    pub async fn create_active_process_record(
        &self,
        id: &str,
    ) -> Result<ActiveProcessRecord, StoreError> {
        let id = id.to_string();
        self.call(move |inner| inner.db.create_process(&id)).await
    }

    pub async fn delete_active_process_record(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.call(move |inner| inner.db.delete_process(&id)).await
    }

    #[cfg(test)]
    pub(crate) async fn is_cached(&self, id: &str) -> bool {
        let id = id.to_string();
        self.call(move |inner| Ok(inner.cache.contains(&id)))
            .await
            .unwrap_or(false)
    }
}
