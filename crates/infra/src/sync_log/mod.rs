//! Sync log: audit record of every synchronization cycle.

pub mod entry;
pub mod postgres;
pub mod store;

pub use entry::{
    ErrorKind, SyncDirection, SyncErrorDetail, SyncLogEntry, SyncLogError, SyncStatus, SyncType,
};
pub use postgres::PostgresSyncLog;
pub use store::{InMemorySyncLog, SyncLogRecorder};
