//! Publish queue abstraction and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use innsync_core::{ConnectionId, TaskId};

use super::types::{
    FailureOutcome, PublishTask, PublishTaskInput, QueueError, RetryPolicy, TaskStatus,
};

/// Per-connection work queue of outbound publish tasks.
#[async_trait::async_trait]
pub trait PublishQueue: Send + Sync {
    /// Add a task, coalescing with an equivalent queued one.
    ///
    /// Returns the task that will carry the work (the surviving task when
    /// coalesced). A coalesced task is ready at once with a fresh attempt
    /// budget, even if it was backing off after a failure.
    async fn enqueue(&self, input: PublishTaskInput) -> Result<PublishTask, QueueError>;

    /// Claim up to `max` ready tasks for one connection, highest priority
    /// first and FIFO within a priority. Claimed tasks are `Processing`.
    async fn dequeue_next_batch(
        &self,
        connection_id: ConnectionId,
        max: usize,
    ) -> Result<Vec<PublishTask>, QueueError>;

    /// Processing -> completed. The task leaves the active queue.
    async fn mark_completed(&self, task_id: TaskId) -> Result<(), QueueError>;

    /// Processing -> queued (retry) or failed (ceiling reached).
    async fn mark_failed(&self, task_id: TaskId, error: &str) -> Result<FailureOutcome, QueueError>;

    /// Processing -> queued without consuming an attempt.
    async fn requeue(&self, task_id: TaskId) -> Result<(), QueueError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<PublishTask>, QueueError>;

    /// Queued and processing tasks, in dequeue order.
    async fn snapshot(&self, connection_id: Option<ConnectionId>) -> Result<Vec<PublishTask>, QueueError>;

    /// Permanently failed tasks, oldest first.
    async fn failed_tasks(&self, connection_id: Option<ConnectionId>) -> Result<Vec<PublishTask>, QueueError>;

    /// Put a permanently failed task back in the queue.
    async fn retry_failed(&self, task_id: TaskId) -> Result<PublishTask, QueueError>;

    async fn stats(&self, connection_id: ConnectionId) -> Result<QueueStats, QueueError>;

    /// Return every processing task to the queue (startup recovery after a
    /// crash mid-cycle). Returns how many were moved.
    async fn requeue_in_flight(&self) -> Result<usize, QueueError>;
}

/// Queue statistics for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queued: usize,
    /// Queued tasks that have failed at least once.
    pub retrying: usize,
    pub processing: usize,
    pub failed: usize,
    pub oldest_queued_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a PublishTask>) -> Self {
        let mut stats = QueueStats::default();
        for task in tasks {
            match task.status {
                TaskStatus::Queued => {
                    stats.queued += 1;
                    if task.attempts > 0 {
                        stats.retrying += 1;
                    }
                    stats.oldest_queued_at = Some(match stats.oldest_queued_at {
                        Some(at) => at.min(task.created_at),
                        None => task.created_at,
                    });
                }
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Completed => {}
            }
        }
        stats
    }
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    task: PublishTask,
}

#[derive(Debug, Default)]
struct QueueState {
    slots: HashMap<TaskId, Slot>,
    next_seq: u64,
}

impl QueueState {
    fn slot_mut(&mut self, task_id: TaskId) -> Result<&mut Slot, QueueError> {
        self.slots.get_mut(&task_id).ok_or(QueueError::NotFound(task_id))
    }

    /// Tasks matching `filter`, in dequeue order.
    fn ordered(&self, filter: impl Fn(&PublishTask) -> bool) -> Vec<&Slot> {
        let mut slots: Vec<&Slot> = self.slots.values().filter(|s| filter(&s.task)).collect();
        slots.sort_by(|a, b| {
            b.task
                .priority
                .cmp(&a.task.priority)
                .then(a.task.created_at.cmp(&b.task.created_at))
                .then(a.seq.cmp(&b.seq))
        });
        slots
    }
}

/// In-memory publish queue for tests and single-process deployments.
///
/// All operations take one short synchronous lock; nothing is held across an
/// `.await`.
#[derive(Debug)]
pub struct InMemoryPublishQueue {
    state: Mutex<QueueState>,
    policy: RetryPolicy,
}

impl InMemoryPublishQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            policy,
        }
    }

    pub fn arc(policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self::new(policy))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryPublishQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait::async_trait]
impl PublishQueue for InMemoryPublishQueue {
    async fn enqueue(&self, input: PublishTaskInput) -> Result<PublishTask, QueueError> {
        let now = Utc::now();
        let mut state = self.state();

        if let Some(slot) = state
            .slots
            .values_mut()
            .find(|s| s.task.status == TaskStatus::Queued && s.task.is_equivalent(&input))
        {
            slot.task.absorb(input.priority, now);
            tracing::debug!(
                task_id = %slot.task.id,
                connection_id = %slot.task.connection_id,
                kind = slot.task.kind.as_str(),
                "coalesced publish task"
            );
            return Ok(slot.task.clone());
        }

        let task = PublishTask::from_input(input, now);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.slots.insert(
            task.id,
            Slot {
                seq,
                task: task.clone(),
            },
        );
        tracing::debug!(
            task_id = %task.id,
            connection_id = %task.connection_id,
            kind = task.kind.as_str(),
            "enqueued publish task"
        );
        Ok(task)
    }

    async fn dequeue_next_batch(
        &self,
        connection_id: ConnectionId,
        max: usize,
    ) -> Result<Vec<PublishTask>, QueueError> {
        let now = Utc::now();
        let mut state = self.state();
        let ids: Vec<TaskId> = state
            .ordered(|t| t.connection_id == connection_id && t.is_ready(now))
            .into_iter()
            .take(max)
            .map(|s| s.task.id)
            .collect();

        let mut batch = Vec::with_capacity(ids.len());
        for id in ids {
            let slot = state.slot_mut(id)?;
            slot.task.mark_processing(now)?;
            batch.push(slot.task.clone());
        }
        Ok(batch)
    }

    async fn mark_completed(&self, task_id: TaskId) -> Result<(), QueueError> {
        let mut state = self.state();
        state.slot_mut(task_id)?.task.mark_completed(Utc::now())?;
        state.slots.remove(&task_id);
        Ok(())
    }

    async fn mark_failed(&self, task_id: TaskId, error: &str) -> Result<FailureOutcome, QueueError> {
        let mut state = self.state();
        let slot = state.slot_mut(task_id)?;
        slot.task.mark_failed(error, &self.policy, Utc::now())
    }

    async fn requeue(&self, task_id: TaskId) -> Result<(), QueueError> {
        let mut state = self.state();
        state.slot_mut(task_id)?.task.requeue(Utc::now())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<PublishTask>, QueueError> {
        Ok(self.state().slots.get(&task_id).map(|s| s.task.clone()))
    }

    async fn snapshot(&self, connection_id: Option<ConnectionId>) -> Result<Vec<PublishTask>, QueueError> {
        let state = self.state();
        Ok(state
            .ordered(|t| {
                matches!(t.status, TaskStatus::Queued | TaskStatus::Processing)
                    && connection_id.is_none_or(|c| t.connection_id == c)
            })
            .into_iter()
            .map(|s| s.task.clone())
            .collect())
    }

    async fn failed_tasks(&self, connection_id: Option<ConnectionId>) -> Result<Vec<PublishTask>, QueueError> {
        let state = self.state();
        let mut failed: Vec<PublishTask> = state
            .slots
            .values()
            .filter(|s| {
                s.task.status == TaskStatus::Failed
                    && connection_id.is_none_or(|c| s.task.connection_id == c)
            })
            .map(|s| s.task.clone())
            .collect();
        failed.sort_by_key(|t| t.created_at);
        Ok(failed)
    }

    async fn retry_failed(&self, task_id: TaskId) -> Result<PublishTask, QueueError> {
        let mut state = self.state();
        let slot = state.slot_mut(task_id)?;
        slot.task.reset_for_retry(Utc::now())?;
        tracing::info!(task_id = %task_id, "failed publish task re-queued by operator");
        Ok(slot.task.clone())
    }

    async fn stats(&self, connection_id: ConnectionId) -> Result<QueueStats, QueueError> {
        let state = self.state();
        Ok(QueueStats::from_tasks(
            state
                .slots
                .values()
                .map(|s| &s.task)
                .filter(|t| t.connection_id == connection_id),
        ))
    }

    async fn requeue_in_flight(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut state = self.state();
        let mut moved = 0;
        for slot in state.slots.values_mut() {
            if slot.task.status == TaskStatus::Processing {
                slot.task.requeue(now)?;
                moved += 1;
            }
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::NaiveDate;
    use innsync_core::{RoomTypeId, StayRange};

    use super::*;
    use crate::queue::types::{RoomScope, TaskKind, TaskPayload, TaskPriority};

    fn input(connection_id: ConnectionId, priority: TaskPriority, scope: RoomScope) -> PublishTaskInput {
        let day: NaiveDate = "2024-06-01".parse().unwrap();
        PublishTaskInput {
            connection_id,
            kind: TaskKind::Availability,
            priority,
            payload: TaskPayload {
                room_scope: scope,
                range: StayRange::single_night(day).unwrap(),
            },
        }
    }

    #[tokio::test]
    async fn equivalent_queued_tasks_coalesce() {
        let queue = InMemoryPublishQueue::default();
        let conn = ConnectionId::new();

        let first = queue.enqueue(input(conn, TaskPriority::Low, RoomScope::All)).await.unwrap();
        let second = queue.enqueue(input(conn, TaskPriority::High, RoomScope::All)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.priority, TaskPriority::High);
        assert_eq!(queue.snapshot(Some(conn)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_change_on_a_backing_off_task_is_ready_immediately() {
        let queue = InMemoryPublishQueue::new(RetryPolicy::fixed(5, Duration::from_secs(900)));
        let conn = ConnectionId::new();

        let old = queue.enqueue(input(conn, TaskPriority::Normal, RoomScope::All)).await.unwrap();
        queue.dequeue_next_batch(conn, 10).await.unwrap();
        queue.mark_failed(old.id, "502").await.unwrap();
        assert!(queue.dequeue_next_batch(conn, 10).await.unwrap().is_empty());

        let fresh = queue.enqueue(input(conn, TaskPriority::High, RoomScope::All)).await.unwrap();
        assert_eq!(fresh.id, old.id);
        assert_eq!(fresh.attempts, 0);
        assert_eq!(fresh.last_error, None);

        let ready = queue.dequeue_next_batch(conn, 10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].priority, TaskPriority::High);
    }

    #[tokio::test]
    async fn processing_task_is_not_coalesced() {
        let queue = InMemoryPublishQueue::default();
        let conn = ConnectionId::new();

        queue.enqueue(input(conn, TaskPriority::Normal, RoomScope::All)).await.unwrap();
        let claimed = queue.dequeue_next_batch(conn, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let fresh = queue.enqueue(input(conn, TaskPriority::Normal, RoomScope::All)).await.unwrap();
        assert_ne!(fresh.id, claimed[0].id);
        assert_eq!(fresh.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn dequeue_is_priority_then_fifo() {
        let queue = InMemoryPublishQueue::default();
        let conn = ConnectionId::new();

        let low = queue
            .enqueue(input(conn, TaskPriority::Low, RoomScope::RoomType(RoomTypeId::new())))
            .await
            .unwrap();
        let normal_a = queue
            .enqueue(input(conn, TaskPriority::Normal, RoomScope::RoomType(RoomTypeId::new())))
            .await
            .unwrap();
        let high = queue
            .enqueue(input(conn, TaskPriority::High, RoomScope::RoomType(RoomTypeId::new())))
            .await
            .unwrap();
        let normal_b = queue
            .enqueue(input(conn, TaskPriority::Normal, RoomScope::RoomType(RoomTypeId::new())))
            .await
            .unwrap();
        queue
            .enqueue(input(ConnectionId::new(), TaskPriority::High, RoomScope::All))
            .await
            .unwrap();

        let batch = queue.dequeue_next_batch(conn, 10).await.unwrap();
        let ids: Vec<TaskId> = batch.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high.id, normal_a.id, normal_b.id, low.id]);
        assert!(batch.iter().all(|t| t.status == TaskStatus::Processing));
    }

    #[tokio::test]
    async fn batch_size_is_respected() {
        let queue = InMemoryPublishQueue::default();
        let conn = ConnectionId::new();
        for _ in 0..3 {
            queue
                .enqueue(input(conn, TaskPriority::Normal, RoomScope::RoomType(RoomTypeId::new())))
                .await
                .unwrap();
        }
        assert_eq!(queue.dequeue_next_batch(conn, 2).await.unwrap().len(), 2);
        assert_eq!(queue.dequeue_next_batch(conn, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_ceiling_moves_task_to_failed_list() {
        let queue = InMemoryPublishQueue::new(RetryPolicy::fixed(2, Duration::ZERO));
        let conn = ConnectionId::new();
        let task = queue.enqueue(input(conn, TaskPriority::Normal, RoomScope::All)).await.unwrap();

        queue.dequeue_next_batch(conn, 1).await.unwrap();
        let first = queue.mark_failed(task.id, "status 503").await.unwrap();
        assert!(matches!(first, FailureOutcome::Retrying { attempts: 1, .. }));

        queue.dequeue_next_batch(conn, 1).await.unwrap();
        let second = queue.mark_failed(task.id, "status 503").await.unwrap();
        assert_eq!(second, FailureOutcome::Exhausted { attempts: 2 });

        assert!(queue.dequeue_next_batch(conn, 1).await.unwrap().is_empty());
        let failed = queue.failed_tasks(Some(conn)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("status 503"));

        let retried = queue.retry_failed(task.id).await.unwrap();
        assert_eq!(retried.attempts, 0);
        assert_eq!(queue.dequeue_next_batch(conn, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backoff_hides_task_until_due() {
        let queue = InMemoryPublishQueue::new(RetryPolicy::fixed(5, Duration::from_secs(3600)));
        let conn = ConnectionId::new();
        let task = queue.enqueue(input(conn, TaskPriority::Normal, RoomScope::All)).await.unwrap();

        queue.dequeue_next_batch(conn, 1).await.unwrap();
        queue.mark_failed(task.id, "timeout").await.unwrap();

        assert!(queue.dequeue_next_batch(conn, 1).await.unwrap().is_empty());
        let stats = queue.stats(conn).await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.retrying, 1);
    }

    #[tokio::test]
    async fn completed_tasks_leave_the_queue() {
        let queue = InMemoryPublishQueue::default();
        let conn = ConnectionId::new();
        let task = queue.enqueue(input(conn, TaskPriority::Normal, RoomScope::All)).await.unwrap();

        assert!(matches!(
            queue.mark_completed(task.id).await,
            Err(QueueError::InvalidTransition { .. })
        ));

        queue.dequeue_next_batch(conn, 1).await.unwrap();
        queue.mark_completed(task.id).await.unwrap();
        assert!(queue.get(task.id).await.unwrap().is_none());
        assert!(matches!(
            queue.mark_completed(task.id).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn in_flight_tasks_are_recovered() {
        let queue = InMemoryPublishQueue::default();
        let conn = ConnectionId::new();
        queue.enqueue(input(conn, TaskPriority::Normal, RoomScope::All)).await.unwrap();
        queue.dequeue_next_batch(conn, 1).await.unwrap();

        assert_eq!(queue.requeue_in_flight().await.unwrap(), 1);
        let stats = queue.stats(conn).await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.processing, 0);
    }
}
