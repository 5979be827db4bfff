//! Test support: a scripted in-process channel transport and an in-memory
//! engine harness.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue};

use innsync_core::{ConnectionId, HotelId, ReservationId, RoomTypeId, StayRange, TaskId};
use innsync_inventory::{
    InventoryDayLoad, InventoryKey, ReservationSnapshot, ReservationStatus, Restrictions,
};

use crate::channel::credit::{HEADER_CREDITS_REMAINING, HEADER_CREDITS_RESET, HEADER_REQUEST_COST};
use crate::channel::{
    AdapterRegistry, BackoffTiers, ChannelRequest, ChannelResponse, ChannelTransport, ChannelType,
    PullMode, TransportError,
};
use crate::config::{ClientConfig, ConnectionConfig, RoomMapping, Secret};
use crate::ledger::{InMemoryInventoryLedger, InventoryLedger};
use crate::orchestrator::{OrchestratorParts, SyncOrchestrator};
use crate::queue::{
    FailureOutcome, InMemoryPublishQueue, PublishQueue, PublishTask, PublishTaskInput, QueueError,
    QueueStats, RetryPolicy, RoomScope, TaskKind, TaskPayload, TaskPriority,
};
use crate::rates::InMemoryRateTable;
use crate::reservations::InMemoryReservationDirectory;
use crate::sync_log::InMemorySyncLog;

#[derive(Debug, Clone)]
pub struct ScriptedReply {
    status: u16,
    body: String,
    headers: HeaderMap,
    delay: Duration,
}

impl ScriptedReply {
    pub fn ok() -> Self {
        Self::status(200)
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            headers: HeaderMap::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn credits(mut self, remaining: i64, resets_in_secs: u64) -> Self {
        self.headers
            .insert(HEADER_CREDITS_REMAINING, HeaderValue::from(remaining));
        self.headers
            .insert(HEADER_CREDITS_RESET, HeaderValue::from(resets_in_secs));
        self.headers.insert(HEADER_REQUEST_COST, HeaderValue::from(1u32));
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Replays queued replies in order and records every request it saw.
/// An empty script answers with a network error.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ChannelRequest>>,
}

impl ScriptedTransport {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn requests(&self) -> Vec<ChannelRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl ChannelTransport for ScriptedTransport {
    async fn send(&self, request: ChannelRequest) -> Result<ChannelResponse, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        let Some(reply) = reply else {
            return Err(TransportError::Network("no scripted reply left".into()));
        };
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        Ok(ChannelResponse {
            status: reply.status,
            headers: reply.headers,
            body: reply.body,
        })
    }
}

/// Queue that fails `mark_completed` a set number of times, then delegates.
pub struct FailingCompletions {
    inner: Arc<dyn PublishQueue>,
    failures_left: Mutex<u32>,
}

impl FailingCompletions {
    pub fn wrap(inner: Arc<dyn PublishQueue>, failures: u32) -> Arc<dyn PublishQueue> {
        Arc::new(Self {
            inner,
            failures_left: Mutex::new(failures),
        })
    }
}

#[async_trait::async_trait]
impl PublishQueue for FailingCompletions {
    async fn enqueue(&self, input: PublishTaskInput) -> Result<PublishTask, QueueError> {
        self.inner.enqueue(input).await
    }

    async fn dequeue_next_batch(&self, connection_id: ConnectionId, max: usize) -> Result<Vec<PublishTask>, QueueError> {
        self.inner.dequeue_next_batch(connection_id, max).await
    }

    async fn mark_completed(&self, task_id: TaskId) -> Result<(), QueueError> {
        {
            let mut left = self.failures_left.lock().unwrap_or_else(PoisonError::into_inner);
            if *left > 0 {
                *left -= 1;
                return Err(QueueError::Storage("connection reset".into()));
            }
        }
        self.inner.mark_completed(task_id).await
    }

    async fn mark_failed(&self, task_id: TaskId, error: &str) -> Result<FailureOutcome, QueueError> {
        self.inner.mark_failed(task_id, error).await
    }

    async fn requeue(&self, task_id: TaskId) -> Result<(), QueueError> {
        self.inner.requeue(task_id).await
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<PublishTask>, QueueError> {
        self.inner.get(task_id).await
    }

    async fn snapshot(&self, connection_id: Option<ConnectionId>) -> Result<Vec<PublishTask>, QueueError> {
        self.inner.snapshot(connection_id).await
    }

    async fn failed_tasks(&self, connection_id: Option<ConnectionId>) -> Result<Vec<PublishTask>, QueueError> {
        self.inner.failed_tasks(connection_id).await
    }

    async fn retry_failed(&self, task_id: TaskId) -> Result<PublishTask, QueueError> {
        self.inner.retry_failed(task_id).await
    }

    async fn stats(&self, connection_id: ConnectionId) -> Result<QueueStats, QueueError> {
        self.inner.stats(connection_id).await
    }

    async fn requeue_in_flight(&self) -> Result<usize, QueueError> {
        self.inner.requeue_in_flight().await
    }
}

/// In-memory engine with one connection (room code `DBL`) on a scripted
/// transport.
pub struct Harness {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub transport: Arc<ScriptedTransport>,
    pub queue: Arc<InMemoryPublishQueue>,
    pub ledger: Arc<InMemoryInventoryLedger>,
    pub recorder: Arc<InMemorySyncLog>,
    pub rates: Arc<InMemoryRateTable>,
    pub connection: ConnectionConfig,
    pub hotel_id: HotelId,
    pub room_type_id: RoomTypeId,
}

impl Harness {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_channel(ChannelType::ChannelManager, policy)
    }

    pub fn with_channel(channel_type: ChannelType, policy: RetryPolicy) -> Self {
        let (hotel_id, room_type_id) = (HotelId::new(), RoomTypeId::new());
        let connection = ConnectionConfig {
            id: ConnectionId::new(),
            hotel_id,
            channel_type,
            endpoint: "https://channel.test".into(),
            api_key: Secret::new("test-key"),
            property_code: "H1".into(),
            enabled: true,
            pull_modes: PullMode::ALL.to_vec(),
            room_mappings: vec![RoomMapping {
                room_type_id,
                room_code: "DBL".into(),
            }],
            timeout_secs: None,
        };

        Self::assemble(
            connection,
            InMemoryPublishQueue::arc(policy),
            InMemoryInventoryLedger::arc(),
            InMemorySyncLog::arc(),
            Arc::new(InMemoryRateTable::new()),
            |queue| queue,
        )
    }

    /// Engine whose orchestrator reaches the queue through `wrap`; `queue`
    /// still exposes the underlying in-memory store.
    pub fn with_queue(
        policy: RetryPolicy,
        wrap: impl FnOnce(Arc<dyn PublishQueue>) -> Arc<dyn PublishQueue>,
    ) -> Self {
        let base = Self::new(policy);
        Self::assemble(
            base.connection.clone(),
            base.queue.clone(),
            base.ledger.clone(),
            base.recorder.clone(),
            base.rates.clone(),
            wrap,
        )
    }

    /// A new engine over the same stores, as after a worker restart: fresh
    /// orchestrator, reservation directory and transport.
    pub fn restart(&self) -> Self {
        Self::assemble(
            self.connection.clone(),
            self.queue.clone(),
            self.ledger.clone(),
            self.recorder.clone(),
            self.rates.clone(),
            |queue| queue,
        )
    }

    fn assemble(
        connection: ConnectionConfig,
        queue: Arc<InMemoryPublishQueue>,
        ledger: Arc<InMemoryInventoryLedger>,
        recorder: Arc<InMemorySyncLog>,
        rates: Arc<InMemoryRateTable>,
        wrap: impl FnOnce(Arc<dyn PublishQueue>) -> Arc<dyn PublishQueue>,
    ) -> Self {
        let transport = ScriptedTransport::arc();
        let scripted = transport.clone();

        let orchestrator = SyncOrchestrator::new(
            OrchestratorParts {
                ledger: ledger.clone(),
                queue: wrap(queue.clone() as Arc<dyn PublishQueue>),
                rates: rates.clone(),
                directory: Arc::new(InMemoryReservationDirectory::new()),
                recorder: recorder.clone(),
                adapters: AdapterRegistry::with_defaults(),
                tiers: BackoffTiers::default(),
                client: ClientConfig::default(),
                batch_size: 10,
                full_sync_horizon_days: 30,
            },
            Arc::new(vec![connection.clone()]),
            move |_| Ok(scripted.clone() as Arc<dyn ChannelTransport>),
        )
        .unwrap();

        Self {
            orchestrator: Arc::new(orchestrator),
            transport,
            queue,
            ledger,
            recorder,
            rates,
            hotel_id: connection.hotel_id,
            room_type_id: connection.room_mappings[0].room_type_id,
            connection,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id
    }

    pub async fn load(&self, day: &str, allotment: u32) {
        self.ledger
            .load_day(InventoryDayLoad {
                key: InventoryKey::new(self.hotel_id, self.room_type_id, date(day)),
                allotment,
                restrictions: Restrictions::default(),
            })
            .await
            .unwrap();
    }

    pub async fn allotment(&self, day: &str) -> u32 {
        self.ledger
            .get_availability(self.hotel_id, self.room_type_id, date(day))
            .await
            .unwrap()
            .map(|d| d.allotment)
            .unwrap_or_default()
    }

    pub async fn enqueue(&self, kind: TaskKind, day: &str) -> PublishTask {
        self.queue
            .enqueue(PublishTaskInput {
                connection_id: self.connection.id,
                kind,
                priority: TaskPriority::Normal,
                payload: TaskPayload {
                    room_scope: RoomScope::RoomType(self.room_type_id),
                    range: StayRange::single_night(date(day)).unwrap(),
                },
            })
            .await
            .unwrap()
    }

    pub fn reservation(&self, check_in: &str, check_out: &str, status: ReservationStatus) -> ReservationSnapshot {
        ReservationSnapshot {
            id: ReservationId::new(),
            hotel_id: self.hotel_id,
            room_type_id: self.room_type_id,
            stay: StayRange::new(date(check_in), date(check_out)).unwrap(),
            status,
        }
    }
}

pub fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}
