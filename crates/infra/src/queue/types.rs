//! Publish task types, lifecycle and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use innsync_core::{ConnectionId, RoomTypeId, StayRange, TaskId};

/// What a task pushes to the channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Rate,
    Availability,
    FullSync,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Rate => "rate",
            TaskKind::Availability => "availability",
            TaskKind::FullSync => "full_sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rate" => Some(TaskKind::Rate),
            "availability" => Some(TaskKind::Availability),
            "full_sync" => Some(TaskKind::FullSync),
            _ => None,
        }
    }

    pub fn includes_availability(&self) -> bool {
        matches!(self, TaskKind::Availability | TaskKind::FullSync)
    }

    pub fn includes_rates(&self) -> bool {
        matches!(self, TaskKind::Rate | TaskKind::FullSync)
    }
}

/// Dequeue priority. Ordering is `Low < Normal < High`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl TaskPriority {
    pub fn rank(&self) -> i16 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 1,
            TaskPriority::High => 2,
        }
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        match rank {
            0 => Some(TaskPriority::Low),
            1 => Some(TaskPriority::Normal),
            2 => Some(TaskPriority::High),
            _ => None,
        }
    }
}

/// Which room types a task covers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "room_type_id")]
pub enum RoomScope {
    /// Every room type mapped on the connection.
    All,
    RoomType(RoomTypeId),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskPayload {
    pub room_scope: RoomScope,
    pub range: StayRange,
}

/// Caller-supplied part of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTaskInput {
    pub connection_id: ConnectionId,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub payload: TaskPayload,
}

/// Task lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    /// Permanently failed (attempt ceiling reached).
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry spacing for failed publish attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempt ceiling: the task fails permanently after this many failures.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(15 * 60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Delay before the retry that follows failure number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_seed(attempt, 0)
    }

    /// As `delay_for_attempt`, with the jitter seeded by the task id so tasks
    /// failing together spread out.
    pub fn delay_for_task(&self, attempt: u32, task_id: TaskId) -> Duration {
        self.delay_with_seed(attempt, task_id.as_uuid().as_u64_pair().1)
    }

    fn delay_with_seed(&self, attempt: u32, seed: u64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = (seed.wrapping_add(u64::from(attempt) * 17) % 100) as f64 / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Result of `mark_failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back in the queue, eligible again at `next_attempt_at`.
    Retrying {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Attempt ceiling reached; the task is now `Failed`.
    Exhausted { attempts: u32 },
}

/// Queue operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("publish task not found: {0}")]
    NotFound(TaskId),
    #[error("publish task {task_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("queue storage error: {0}")]
    Storage(String),
}

/// A unit of outbound work for one channel connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishTask {
    pub id: TaskId,
    pub connection_id: ConnectionId,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    /// Failed attempts so far (rate-limited requeues do not count).
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the task may be dequeued again.
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl PublishTask {
    pub fn from_input(input: PublishTaskInput, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            connection_id: input.connection_id,
            kind: input.kind,
            priority: input.priority,
            payload: input.payload,
            status: TaskStatus::Queued,
            attempts: 0,
            created_at: now,
            updated_at: now,
            next_attempt_at: now,
            last_error: None,
        }
    }

    /// Same connection, kind, room scope and date range.
    pub fn is_equivalent(&self, input: &PublishTaskInput) -> bool {
        self.connection_id == input.connection_id
            && self.kind == input.kind
            && self.payload == input.payload
    }

    /// Fold an equivalent enqueue into this queued task. The newer change
    /// supersedes whatever failed before: the task becomes ready now with a
    /// fresh attempt budget, keeps its FIFO position and takes the higher
    /// priority.
    pub fn absorb(&mut self, priority: TaskPriority, now: DateTime<Utc>) {
        self.priority = self.priority.max(priority);
        self.attempts = 0;
        self.last_error = None;
        self.next_attempt_at = self.next_attempt_at.min(now);
        self.updated_at = now;
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Queued && self.next_attempt_at <= now
    }

    fn transition(&mut self, from: TaskStatus, to: TaskStatus) -> Result<(), QueueError> {
        if self.status != from {
            return Err(QueueError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.transition(TaskStatus::Queued, TaskStatus::Processing)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.transition(TaskStatus::Processing, TaskStatus::Completed)?;
        self.updated_at = now;
        self.last_error = None;
        Ok(())
    }

    /// Back to queued without consuming an attempt.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.transition(TaskStatus::Processing, TaskStatus::Queued)?;
        self.updated_at = now;
        Ok(())
    }

    /// Operator re-queue of a permanently failed task, with a fresh attempt budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.transition(TaskStatus::Failed, TaskStatus::Queued)?;
        self.attempts = 0;
        self.updated_at = now;
        self.next_attempt_at = now;
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, QueueError> {
        if self.status != TaskStatus::Processing {
            return Err(QueueError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: TaskStatus::Failed,
            });
        }

        self.attempts += 1;
        self.updated_at = now;
        self.last_error = Some(error.to_string());

        if policy.should_retry(self.attempts) {
            let delay = policy.delay_for_task(self.attempts, self.id);
            self.next_attempt_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            self.status = TaskStatus::Queued;
            Ok(FailureOutcome::Retrying {
                attempts: self.attempts,
                next_attempt_at: self.next_attempt_at,
            })
        } else {
            self.status = TaskStatus::Failed;
            Ok(FailureOutcome::Exhausted {
                attempts: self.attempts,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn input() -> PublishTaskInput {
        let day: NaiveDate = "2024-06-01".parse().unwrap();
        PublishTaskInput {
            connection_id: ConnectionId::new(),
            kind: TaskKind::Availability,
            priority: TaskPriority::Normal,
            payload: TaskPayload {
                room_scope: RoomScope::All,
                range: StayRange::single_night(day).unwrap(),
            },
        }
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(10));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            jitter: 0.0,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_differs_between_tasks() {
        let policy = RetryPolicy::default();
        let a = TaskId::from_uuid(uuid::Uuid::from_u64_pair(0, 3));
        let b = TaskId::from_uuid(uuid::Uuid::from_u64_pair(0, 40));
        let (da, db) = (policy.delay_for_task(1, a), policy.delay_for_task(1, b));
        assert_ne!(da, db);
        for d in [da, db] {
            assert!(d >= Duration::from_secs(27) && d <= Duration::from_secs(33));
        }
    }

    #[test]
    fn absorbing_an_enqueue_clears_the_retry_backoff() {
        let now = Utc::now();
        let mut task = PublishTask::from_input(input(), now);
        task.mark_processing(now).unwrap();
        task.mark_failed("502", &RetryPolicy::fixed(5, Duration::from_secs(900)), now)
            .unwrap();
        assert!(!task.is_ready(now));

        task.absorb(TaskPriority::High, now);
        assert!(task.is_ready(now));
        assert_eq!(task.attempts, 0);
        assert_eq!(task.last_error, None);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.created_at, now);
    }

    #[test]
    fn priority_orders_high_first() {
        let mut ps = vec![TaskPriority::Normal, TaskPriority::High, TaskPriority::Low];
        ps.sort_by(|a, b| b.cmp(a));
        assert_eq!(ps, vec![TaskPriority::High, TaskPriority::Normal, TaskPriority::Low]);
    }

    #[test]
    fn completion_requires_processing() {
        let mut task = PublishTask::from_input(input(), Utc::now());
        let err = task.mark_completed(Utc::now()).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { from: TaskStatus::Queued, .. }));

        task.mark_processing(Utc::now()).unwrap();
        task.mark_completed(Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn failure_retries_until_ceiling() {
        let policy = RetryPolicy::fixed(2, Duration::from_secs(60));
        let mut task = PublishTask::from_input(input(), Utc::now());

        task.mark_processing(Utc::now()).unwrap();
        let now = Utc::now();
        let outcome = task.mark_failed("timeout", &policy, now).unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Retrying {
                attempts: 1,
                next_attempt_at: now + chrono::Duration::seconds(60)
            }
        );
        assert!(!task.is_ready(now));

        task.mark_processing(Utc::now()).unwrap();
        let outcome = task.mark_failed("timeout", &policy, Utc::now()).unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted { attempts: 2 });
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn requeue_keeps_attempts() {
        let mut task = PublishTask::from_input(input(), Utc::now());
        task.mark_processing(Utc::now()).unwrap();
        task.requeue(Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempts, 0);
    }
}
