//! Content-addressed result cache.
//!
//! Stores the latest successful result per `(kind, name, version)`. Status
//! and result tasks read it to short-circuit executions; invalidation happens
//! only by version change. Process-local by design; persistence is a plugin
//! concern.

use std::collections::HashMap;
use std::sync::RwLock;

use garden_config::{ActionKind, ActionRef};

use crate::error::GardenError;
use crate::tasks::TaskResult;

type CacheKey = (ActionKind, String, String);

/// In-memory result cache guarded by a single lock.
#[derive(Default)]
pub struct ResultCache {
    entries: RwLock<HashMap<CacheKey, TaskResult>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(action: &ActionRef, version: &str) -> CacheKey {
        (action.kind, action.name.clone(), version.to_string())
    }

    /// Store a successful execution result.
    pub fn put(&self, result: TaskResult) -> Result<(), GardenError> {
        if !result.success() {
            return Ok(());
        }
        let key = Self::key(&result.action, &result.version);
        let mut entries = self
            .entries
            .write()
            .map_err(|e| GardenError::Internal(format!("result cache poisoned: {}", e)))?;
        entries.insert(key, result);
        Ok(())
    }

    /// Fetch the cached result for an action version.
    pub fn get(&self, action: &ActionRef, version: &str) -> Result<Option<TaskResult>, GardenError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| GardenError::Internal(format!("result cache poisoned: {}", e)))?;
        Ok(entries.get(&Self::key(action, version)).cloned())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
