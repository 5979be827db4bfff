use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use innsync_core::{ConnectionId, SyncLogId, TaskId};

use crate::channel::PullMode;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Push,
    Pull,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Push => "push",
            SyncDirection::Pull => "pull",
        }
    }
}

/// What a cycle synchronized.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "mode")]
pub enum SyncType {
    /// Drain of the publish queue.
    Publish,
    /// Booking pull in one mode.
    Bookings(PullMode),
}

impl SyncType {
    pub fn direction(&self) -> SyncDirection {
        match self {
            SyncType::Publish => SyncDirection::Push,
            SyncType::Bookings(_) => SyncDirection::Pull,
        }
    }

    /// Stable text form, e.g. `publish` or `bookings:arrivals`.
    pub fn label(&self) -> String {
        match self {
            SyncType::Publish => "publish".to_string(),
            SyncType::Bookings(mode) => format!("bookings:{}", mode.as_str()),
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.split_once(':') {
            None if label == "publish" => Some(SyncType::Publish),
            Some(("bookings", mode)) => PullMode::parse(mode).map(SyncType::Bookings),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    /// Closed with no failed item.
    Completed,
    /// Closed with at least one failed or conflicting item.
    Failed,
    /// The cycle was aborted.
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    RateLimited,
    PermanentFailure,
    ReconciliationConflict,
    Mapping,
    Skipped,
    Storage,
}

/// One structured error recorded against a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    pub at: DateTime<Utc>,
}

impl SyncErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            task_id: None,
            external_id: None,
            date: None,
            at: Utc::now(),
        }
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncLogError {
    #[error("sync log entry {0} is closed")]
    Closed(SyncLogId),
    #[error("sync log entry not found: {0}")]
    NotFound(SyncLogId),
    #[error("sync log storage error: {0}")]
    Storage(String),
}

/// Audit record of one synchronization cycle.
///
/// Opened `Pending` at cycle start, mutated as items are processed, and
/// frozen once closed: every mutator on a closed entry returns
/// `SyncLogError::Closed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: SyncLogId,
    pub connection_id: ConnectionId,
    pub sync_type: SyncType,
    pub direction: SyncDirection,
    pub status: SyncStatus,
    pub records_processed: u32,
    pub records_succeeded: u32,
    pub records_failed: u32,
    /// Rate-limited tasks returned to the queue unchanged.
    pub records_requeued: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_details: Vec<SyncErrorDetail>,
}

impl SyncLogEntry {
    pub fn open(connection_id: ConnectionId, sync_type: SyncType) -> Self {
        Self {
            id: SyncLogId::new(),
            connection_id,
            sync_type,
            direction: sync_type.direction(),
            status: SyncStatus::Pending,
            records_processed: 0,
            records_succeeded: 0,
            records_failed: 0,
            records_requeued: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_details: Vec::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.completed_at.is_some()
    }

    fn ensure_open(&self) -> Result<(), SyncLogError> {
        if self.is_closed() {
            return Err(SyncLogError::Closed(self.id));
        }
        Ok(())
    }

    pub fn record_success(&mut self) -> Result<(), SyncLogError> {
        self.ensure_open()?;
        self.records_processed += 1;
        self.records_succeeded += 1;
        Ok(())
    }

    pub fn record_failure(&mut self, detail: SyncErrorDetail) -> Result<(), SyncLogError> {
        self.ensure_open()?;
        self.records_processed += 1;
        self.records_failed += 1;
        self.error_details.push(detail);
        Ok(())
    }

    pub fn record_requeued(&mut self, count: u32) -> Result<(), SyncLogError> {
        self.ensure_open()?;
        self.records_requeued += count;
        Ok(())
    }

    /// Attach a detail that does not count as a failed item.
    pub fn note(&mut self, detail: SyncErrorDetail) -> Result<(), SyncLogError> {
        self.ensure_open()?;
        self.error_details.push(detail);
        Ok(())
    }

    /// Close normally: `Completed`, or `Failed` when any item failed.
    pub fn finish(&mut self) -> Result<(), SyncLogError> {
        self.ensure_open()?;
        self.status = if self.records_failed == 0 {
            SyncStatus::Completed
        } else {
            SyncStatus::Failed
        };
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Close as aborted.
    pub fn abort(&mut self, detail: SyncErrorDetail) -> Result<(), SyncLogError> {
        self.ensure_open()?;
        self.error_details.push(detail);
        self.status = SyncStatus::Error;
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}
