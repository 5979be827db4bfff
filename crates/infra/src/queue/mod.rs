//! Publish queue: per-connection outbound work with retry and backoff.
//!
//! - Tasks are addressed to one channel connection
//! - Priority-then-FIFO dequeue, equivalent queued tasks coalesce
//! - Failed attempts back off exponentially up to an attempt ceiling, then the
//!   task stays in a failed list until an operator re-queues it
//! - Rate-limited tasks go back unchanged via `requeue`

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresPublishQueue;
pub use store::{InMemoryPublishQueue, PublishQueue, QueueStats};
pub use types::{
    BackoffStrategy, FailureOutcome, PublishTask, PublishTaskInput, QueueError, RetryPolicy,
    RoomScope, TaskKind, TaskPayload, TaskPriority, TaskStatus,
};
