use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use innsync_core::{ConnectionId, SyncLogId};

use super::entry::{SyncLogEntry, SyncLogError};

/// Durable store for sync log entries.
#[async_trait::async_trait]
pub trait SyncLogRecorder: Send + Sync {
    async fn insert(&self, entry: &SyncLogEntry) -> Result<(), SyncLogError>;

    /// Persist progress. Fails with `Closed` once the stored entry is closed.
    async fn update(&self, entry: &SyncLogEntry) -> Result<(), SyncLogError>;

    async fn get(&self, id: SyncLogId) -> Result<Option<SyncLogEntry>, SyncLogError>;

    /// Most recent entries first.
    async fn history(
        &self,
        connection_id: Option<ConnectionId>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>, SyncLogError>;
}

#[derive(Debug, Default)]
pub struct InMemorySyncLog {
    entries: RwLock<HashMap<SyncLogId, SyncLogEntry>>,
}

impl InMemorySyncLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl SyncLogRecorder for InMemorySyncLog {
    async fn insert(&self, entry: &SyncLogEntry) -> Result<(), SyncLogError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn update(&self, entry: &SyncLogEntry) -> Result<(), SyncLogError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(&entry.id) {
            Some(stored) if stored.is_closed() => Err(SyncLogError::Closed(entry.id)),
            Some(stored) => {
                *stored = entry.clone();
                Ok(())
            }
            None => Err(SyncLogError::NotFound(entry.id)),
        }
    }

    async fn get(&self, id: SyncLogId) -> Result<Option<SyncLogEntry>, SyncLogError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(&id).cloned())
    }

    async fn history(
        &self,
        connection_id: Option<ConnectionId>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>, SyncLogError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut result: Vec<SyncLogEntry> = entries
            .values()
            .filter(|e| connection_id.is_none_or(|c| e.connection_id == c))
            .cloned()
            .collect();
        // v7 ids are time-ordered and break ties between equal timestamps.
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }
}
