//! Synchronization orchestrator.
//!
//! Push cycles drain a connection's publish queue through its channel
//! adapter and rate-limited client. Pull cycles fetch bookings, map them to
//! internal reservations and feed status transitions through the lifecycle
//! hook. Every cycle is recorded in the sync log.
//!
//! Cycles for different connections run concurrently; cycles for the same
//! connection never overlap (a second caller gets `CycleOutcome::Busy`).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::time::Instant;

use innsync_core::{ConnectionId, DomainError, StayRange, TaskId};
use innsync_inventory::InventoryDay;

use crate::channel::{
    AdapterError, AdapterRegistry, BackoffTiers, ChannelAdapter, ChannelBooking, ChannelError,
    ChannelTransport, CreditState, DaySnapshot, HttpTransport, PullMode, PushSnapshot,
    RateLimitError, RateLimitedClient, RoomSnapshot, TransportError,
};
use crate::config::{ClientConfig, ConnectionConfig, RoomMapping};
use crate::ledger::InventoryLedger;
use crate::lifecycle::{LifecycleError, ReservationLifecycle};
use crate::queue::{
    FailureOutcome, PublishQueue, PublishTask, PublishTaskInput, QueueError, RoomScope, TaskKind,
    TaskPayload, TaskPriority,
};
use crate::rates::{NightlyRate, RateSource};
use crate::reservations::ReservationDirectory;
use crate::sync_log::{
    ErrorKind, SyncErrorDetail, SyncLogEntry, SyncLogError, SyncLogRecorder, SyncType,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown or disabled connection: {0}")]
    UnknownConnection(ConnectionId),
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    SyncLog(#[from] SyncLogError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("failed to build transport for connection {connection_id}: {source}")]
    Transport {
        connection_id: ConnectionId,
        #[source]
        source: TransportError,
    },
}

/// What a cycle call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CycleOutcome {
    /// The cycle ran; the closed log entry is attached.
    Ran { entry: SyncLogEntry },
    /// The connection is paused after a rate limit.
    Paused { until: DateTime<Utc> },
    /// Nothing was queued for the connection.
    Idle,
    /// Another cycle for the connection is in progress.
    Busy,
}

/// Shared collaborators of the orchestrator.
pub struct OrchestratorParts {
    pub ledger: Arc<dyn InventoryLedger>,
    pub queue: Arc<dyn PublishQueue>,
    pub rates: Arc<dyn RateSource>,
    pub directory: Arc<dyn ReservationDirectory>,
    pub recorder: Arc<dyn SyncLogRecorder>,
    pub adapters: AdapterRegistry,
    pub tiers: BackoffTiers,
    pub client: ClientConfig,
    pub batch_size: usize,
    pub full_sync_horizon_days: u32,
}

#[derive(Debug, Clone, Copy)]
struct Pause {
    until: Instant,
    until_utc: DateTime<Utc>,
}

struct ConnectionLane {
    config: ConnectionConfig,
    client: RateLimitedClient,
    adapter: Arc<dyn ChannelAdapter>,
    cycle: tokio::sync::Mutex<()>,
    pause: Mutex<Option<Pause>>,
}

impl ConnectionLane {
    fn paused_until(&self) -> Option<DateTime<Utc>> {
        let mut pause = self.pause.lock().unwrap_or_else(PoisonError::into_inner);
        match *pause {
            Some(p) if p.until > Instant::now() => Some(p.until_utc),
            Some(_) => {
                *pause = None;
                None
            }
            None => None,
        }
    }

    fn pause_for(&self, delay: Duration) -> DateTime<Utc> {
        let until_utc = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        let mut pause = self.pause.lock().unwrap_or_else(PoisonError::into_inner);
        *pause = Some(Pause {
            until: Instant::now() + delay,
            until_utc,
        });
        until_utc
    }
}

enum PushFailure {
    RateLimited(RateLimitError),
    Failed(String),
}

impl From<ChannelError> for PushFailure {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::RateLimited(e) => PushFailure::RateLimited(e),
            ChannelError::Transport(e) => PushFailure::Failed(e.to_string()),
        }
    }
}

impl From<AdapterError> for PushFailure {
    fn from(err: AdapterError) -> Self {
        PushFailure::Failed(err.to_string())
    }
}

pub struct SyncOrchestrator {
    ledger: Arc<dyn InventoryLedger>,
    queue: Arc<dyn PublishQueue>,
    rates: Arc<dyn RateSource>,
    directory: Arc<dyn ReservationDirectory>,
    recorder: Arc<dyn SyncLogRecorder>,
    lifecycle: Arc<ReservationLifecycle>,
    lanes: HashMap<ConnectionId, ConnectionLane>,
    batch_size: usize,
    full_sync_horizon_days: u32,
}

impl SyncOrchestrator {
    /// Build an orchestrator for the enabled connections, with a transport
    /// per connection from `transport_for`.
    pub fn new<F>(
        parts: OrchestratorParts,
        connections: Arc<Vec<ConnectionConfig>>,
        transport_for: F,
    ) -> Result<Self, OrchestratorError>
    where
        F: Fn(&ConnectionConfig) -> Result<Arc<dyn ChannelTransport>, TransportError>,
    {
        let mut lanes = HashMap::new();
        for config in connections.iter().filter(|c| c.enabled) {
            let transport = transport_for(config).map_err(|source| OrchestratorError::Transport {
                connection_id: config.id,
                source,
            })?;
            let lane = ConnectionLane {
                client: RateLimitedClient::new(
                    config.id,
                    transport,
                    parts.tiers.clone(),
                    config.call_timeout(&parts.client),
                ),
                adapter: parts.adapters.get(config.channel_type)?,
                config: config.clone(),
                cycle: tokio::sync::Mutex::new(()),
                pause: Mutex::new(None),
            };
            lanes.insert(config.id, lane);
        }

        let lifecycle = Arc::new(ReservationLifecycle::new(
            parts.ledger.clone(),
            parts.queue.clone(),
            connections,
        ));

        Ok(Self {
            ledger: parts.ledger,
            queue: parts.queue,
            rates: parts.rates,
            directory: parts.directory,
            recorder: parts.recorder,
            lifecycle,
            lanes,
            batch_size: parts.batch_size.max(1),
            full_sync_horizon_days: parts.full_sync_horizon_days.max(1),
        })
    }

    /// Build with an HTTP transport per connection endpoint.
    pub fn with_http(
        parts: OrchestratorParts,
        connections: Arc<Vec<ConnectionConfig>>,
    ) -> Result<Self, OrchestratorError> {
        let client = parts.client.clone();
        Self::new(parts, connections, |config| {
            let transport = HttpTransport::new(
                config.endpoint.clone(),
                config.api_key.clone(),
                config.call_timeout(&client),
            )?;
            Ok(Arc::new(transport) as Arc<dyn ChannelTransport>)
        })
    }

    pub fn lifecycle(&self) -> Arc<ReservationLifecycle> {
        self.lifecycle.clone()
    }

    /// Enabled connections, in no particular order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.lanes.keys().copied().collect()
    }

    pub fn pull_modes(&self, connection_id: ConnectionId) -> Result<Vec<PullMode>, OrchestratorError> {
        Ok(self.lane(connection_id)?.config.pull_modes.clone())
    }

    fn lane(&self, connection_id: ConnectionId) -> Result<&ConnectionLane, OrchestratorError> {
        self.lanes
            .get(&connection_id)
            .ok_or(OrchestratorError::UnknownConnection(connection_id))
    }

    /// Drain up to one batch of the connection's publish queue.
    pub async fn push_cycle(&self, connection_id: ConnectionId) -> Result<CycleOutcome, OrchestratorError> {
        let lane = self.lane(connection_id)?;
        let Ok(_cycle) = lane.cycle.try_lock() else {
            return Ok(CycleOutcome::Busy);
        };
        if let Some(until) = lane.paused_until() {
            tracing::debug!(connection_id = %connection_id, until = %until, "push cycle skipped; connection paused");
            return Ok(CycleOutcome::Paused { until });
        }

        let tasks = self.queue.dequeue_next_batch(connection_id, self.batch_size).await?;
        if tasks.is_empty() {
            return Ok(CycleOutcome::Idle);
        }

        let mut entry = SyncLogEntry::open(connection_id, SyncType::Publish);
        self.recorder.insert(&entry).await?;
        let result = self.run_push(lane, tasks, &mut entry).await;
        self.close(entry, result).await
    }

    async fn run_push(
        &self,
        lane: &ConnectionLane,
        tasks: Vec<PublishTask>,
        entry: &mut SyncLogEntry,
    ) -> Result<(), OrchestratorError> {
        let mut pending: VecDeque<PublishTask> = tasks.into();
        let result = self.push_tasks(lane, &mut pending, entry).await;
        if result.is_err() {
            self.release_unfinished(lane.config.id, pending).await;
        }
        result
    }

    /// Work through `pending` front to back. A task leaves the deque only once
    /// its queue transition is stored.
    async fn push_tasks(
        &self,
        lane: &ConnectionLane,
        pending: &mut VecDeque<PublishTask>,
        entry: &mut SyncLogEntry,
    ) -> Result<(), OrchestratorError> {
        let connection_id = lane.config.id;

        while let Some(task) = pending.front().cloned() {
            match self.publish(lane, &task).await {
                Ok(()) => {
                    self.queue.mark_completed(task.id).await?;
                    pending.pop_front();
                    entry.record_success()?;
                    tracing::debug!(connection_id = %connection_id, task_id = %task.id, kind = task.kind.as_str(), "publish task completed");
                }
                Err(PushFailure::RateLimited(err)) => {
                    let mut requeued = 0u32;
                    while let Some(task) = pending.front() {
                        self.queue.requeue(task.id).await?;
                        pending.pop_front();
                        requeued += 1;
                    }
                    let delay = lane.client.tiers().rate_limit_pause(err.resets_in_secs);
                    let until = lane.pause_for(delay);
                    entry.record_requeued(requeued)?;
                    entry.note(SyncErrorDetail::new(ErrorKind::RateLimited, err.to_string()))?;
                    tracing::warn!(
                        connection_id = %connection_id,
                        requeued,
                        remaining = err.remaining,
                        paused_until = %until,
                        "channel rate limit hit; push cycle stopped"
                    );
                    self.recorder.update(entry).await?;
                    break;
                }
                Err(PushFailure::Failed(message)) => {
                    let outcome = self.queue.mark_failed(task.id, &message).await?;
                    pending.pop_front();
                    let detail = match outcome {
                        FailureOutcome::Exhausted { attempts } => {
                            tracing::error!(
                                connection_id = %connection_id,
                                task_id = %task.id,
                                attempts,
                                error = %message,
                                "publish task failed permanently"
                            );
                            SyncErrorDetail::new(
                                ErrorKind::PermanentFailure,
                                format!("gave up after {attempts} attempts: {message}"),
                            )
                        }
                        FailureOutcome::Retrying {
                            attempts,
                            next_attempt_at,
                        } => {
                            tracing::warn!(
                                connection_id = %connection_id,
                                task_id = %task.id,
                                attempts,
                                next_attempt_at = %next_attempt_at,
                                error = %message,
                                "publish task failed; will retry"
                            );
                            SyncErrorDetail::new(ErrorKind::Transport, message)
                        }
                    };
                    entry.record_failure(detail.with_task(task.id))?;
                }
            }
            self.recorder.update(entry).await?;
        }
        Ok(())
    }

    /// Return claimed tasks to the queue after a cycle failed part way, so
    /// they are not left `Processing` until the next restart.
    async fn release_unfinished(&self, connection_id: ConnectionId, pending: VecDeque<PublishTask>) {
        if pending.is_empty() {
            return;
        }
        let mut released = 0usize;
        for task in &pending {
            match self.queue.requeue(task.id).await {
                Ok(()) => released += 1,
                Err(err) => tracing::error!(
                    connection_id = %connection_id,
                    task_id = %task.id,
                    error = %err,
                    "failed to release publish task; it stays processing until startup recovery"
                ),
            }
        }
        tracing::warn!(connection_id = %connection_id, released, claimed = pending.len(), "released unfinished publish tasks");
    }

    async fn publish(&self, lane: &ConnectionLane, task: &PublishTask) -> Result<(), PushFailure> {
        let snapshot = self.snapshot(&lane.config, task).await.map_err(PushFailure::Failed)?;
        let request = lane.adapter.push_request(&snapshot)?;
        let response = lane.client.call(request).await?;
        lane.adapter.verify_push(&response)?;
        Ok(())
    }

    /// Resolve a task into the data it publishes.
    async fn snapshot(&self, config: &ConnectionConfig, task: &PublishTask) -> Result<PushSnapshot, String> {
        let mappings: Vec<&RoomMapping> = match task.payload.room_scope {
            RoomScope::All => config.room_mappings.iter().collect(),
            RoomScope::RoomType(room_type_id) => {
                let mapping = config
                    .room_mappings
                    .iter()
                    .find(|m| m.room_type_id == room_type_id)
                    .ok_or_else(|| format!("room type {room_type_id} is not mapped on this connection"))?;
                vec![mapping]
            }
        };

        let range = task.payload.range;
        let mut rooms = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let days: BTreeMap<NaiveDate, InventoryDay> = if task.kind.includes_availability() {
                self.ledger
                    .availability_range(config.hotel_id, mapping.room_type_id, range)
                    .await
                    .map_err(|e| e.to_string())?
                    .into_iter()
                    .map(|d| (d.key.date, d))
                    .collect()
            } else {
                BTreeMap::new()
            };
            let rates: BTreeMap<NaiveDate, NightlyRate> = if task.kind.includes_rates() {
                self.rates
                    .nightly_rates(config.hotel_id, mapping.room_type_id, range)
                    .await
                    .map_err(|e| e.to_string())?
                    .into_iter()
                    .map(|r| (r.date, r))
                    .collect()
            } else {
                BTreeMap::new()
            };

            let room_days = range
                .dates()
                .filter_map(|date| {
                    let day = days.get(&date);
                    let rate = rates.get(&date).cloned();
                    (day.is_some() || rate.is_some()).then(|| DaySnapshot {
                        date,
                        availability: day.map(|d| d.allotment),
                        restrictions: day.map(|d| d.restrictions.clone()),
                        rate,
                    })
                })
                .collect();
            rooms.push(RoomSnapshot {
                room_type_id: mapping.room_type_id,
                room_code: mapping.room_code.clone(),
                days: room_days,
            });
        }

        Ok(PushSnapshot {
            connection_id: config.id,
            property_code: config.property_code.clone(),
            kind: task.kind,
            range,
            rooms,
        })
    }

    /// Fetch bookings in one pull mode and reconcile them with the ledger.
    pub async fn pull_cycle(
        &self,
        connection_id: ConnectionId,
        mode: PullMode,
    ) -> Result<CycleOutcome, OrchestratorError> {
        let lane = self.lane(connection_id)?;
        let Ok(_cycle) = lane.cycle.try_lock() else {
            return Ok(CycleOutcome::Busy);
        };
        if let Some(until) = lane.paused_until() {
            tracing::debug!(connection_id = %connection_id, until = %until, "pull cycle skipped; connection paused");
            return Ok(CycleOutcome::Paused { until });
        }

        let mut entry = SyncLogEntry::open(connection_id, SyncType::Bookings(mode));
        self.recorder.insert(&entry).await?;
        let result = self.run_pull(lane, mode, &mut entry).await;
        self.close(entry, result).await
    }

    async fn run_pull(
        &self,
        lane: &ConnectionLane,
        mode: PullMode,
        entry: &mut SyncLogEntry,
    ) -> Result<(), OrchestratorError> {
        let connection_id = lane.config.id;
        let request = lane.adapter.pull_request(&lane.config.property_code, mode);

        let page = match lane.client.call(request).await {
            Ok(response) => match lane.adapter.parse_bookings(&response) {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(connection_id = %connection_id, mode = mode.as_str(), error = %err, "unreadable booking pull");
                    entry.abort(SyncErrorDetail::new(ErrorKind::Transport, err.to_string()))?;
                    return Ok(());
                }
            },
            Err(ChannelError::Transport(TransportError::Timeout(after))) => {
                tracing::warn!(connection_id = %connection_id, mode = mode.as_str(), ?after, "booking pull timed out; skipped");
                entry.note(SyncErrorDetail::new(
                    ErrorKind::Skipped,
                    format!("pull timed out after {after:?}"),
                ))?;
                return Ok(());
            }
            Err(ChannelError::RateLimited(err)) => {
                let delay = lane.client.tiers().rate_limit_pause(err.resets_in_secs);
                let until = lane.pause_for(delay);
                tracing::warn!(connection_id = %connection_id, mode = mode.as_str(), paused_until = %until, "channel rate limit hit during pull");
                entry.record_failure(SyncErrorDetail::new(ErrorKind::RateLimited, err.to_string()))?;
                return Ok(());
            }
            Err(ChannelError::Transport(err)) => {
                tracing::warn!(connection_id = %connection_id, mode = mode.as_str(), error = %err, "booking pull failed");
                entry.abort(SyncErrorDetail::new(ErrorKind::Transport, err.to_string()))?;
                return Ok(());
            }
        };

        tracing::debug!(
            connection_id = %connection_id,
            mode = mode.as_str(),
            count = page.bookings.len(),
            rejected = page.rejected.len(),
            "bookings pulled"
        );
        for rejected in page.rejected {
            tracing::warn!(
                connection_id = %connection_id,
                external_id = rejected.external_id.as_deref().unwrap_or("-"),
                reason = %rejected.reason,
                "unreadable booking record"
            );
            let mut detail = SyncErrorDetail::new(ErrorKind::Mapping, rejected.reason);
            if let Some(external_id) = rejected.external_id {
                detail = detail.with_external_id(external_id);
            }
            entry.record_failure(detail)?;
        }
        for booking in &page.bookings {
            self.reconcile(&lane.config, booking, entry).await?;
            self.recorder.update(entry).await?;
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        config: &ConnectionConfig,
        booking: &ChannelBooking,
        entry: &mut SyncLogEntry,
    ) -> Result<(), OrchestratorError> {
        let Some(room_type_id) = config.room_type_for(&booking.room_code) else {
            tracing::warn!(
                connection_id = %config.id,
                external_id = %booking.external_id,
                room_code = %booking.room_code,
                "booking for unmapped room code"
            );
            entry.record_failure(
                SyncErrorDetail::new(
                    ErrorKind::Mapping,
                    format!("room code {} is not mapped", booking.room_code),
                )
                .with_external_id(&booking.external_id),
            )?;
            return Ok(());
        };

        let upserted = match self
            .directory
            .upsert_channel_booking(config.id, config.hotel_id, room_type_id, booking)
            .await
        {
            Ok(upserted) => upserted,
            Err(err) => {
                entry.record_failure(
                    SyncErrorDetail::new(ErrorKind::Storage, err.to_string())
                        .with_external_id(&booking.external_id),
                )?;
                return Ok(());
            }
        };

        if upserted.previous_status != Some(booking.status) {
            tracing::info!(
                connection_id = %config.id,
                external_id = %booking.external_id,
                reservation_id = %upserted.reservation.id,
                from = upserted.previous_status.map_or("new", |s| s.as_str()),
                to = booking.status.as_str(),
                "channel booking status changed"
            );
        }

        match self.lifecycle.apply_transition(&upserted.reservation).await {
            Ok(_) => entry.record_success()?,
            Err(LifecycleError::Insufficient(conflict)) => {
                tracing::error!(
                    connection_id = %config.id,
                    external_id = %booking.external_id,
                    reservation_id = %upserted.reservation.id,
                    date = %conflict.date,
                    "reconciliation conflict: channel booking cannot be held"
                );
                entry.record_failure(
                    SyncErrorDetail::new(ErrorKind::ReconciliationConflict, conflict.to_string())
                        .with_external_id(&booking.external_id)
                        .with_date(conflict.date),
                )?;
            }
            Err(LifecycleError::Ledger(err)) => {
                entry.record_failure(
                    SyncErrorDetail::new(ErrorKind::Storage, err.to_string())
                        .with_external_id(&booking.external_id),
                )?;
            }
        }
        Ok(())
    }

    /// Close the cycle's entry: finish it when the run succeeded and left it
    /// open, abort it when the run failed.
    async fn close(
        &self,
        mut entry: SyncLogEntry,
        result: Result<(), OrchestratorError>,
    ) -> Result<CycleOutcome, OrchestratorError> {
        match result {
            Ok(()) => {
                if !entry.is_closed() {
                    entry.finish()?;
                }
                self.recorder.update(&entry).await?;
                tracing::info!(
                    connection_id = %entry.connection_id,
                    sync_type = %entry.sync_type.label(),
                    status = entry.status.as_str(),
                    processed = entry.records_processed,
                    failed = entry.records_failed,
                    requeued = entry.records_requeued,
                    "sync cycle finished"
                );
                Ok(CycleOutcome::Ran { entry })
            }
            Err(err) => {
                if !entry.is_closed() && entry.abort(SyncErrorDetail::new(ErrorKind::Storage, err.to_string())).is_ok() {
                    if let Err(update_err) = self.recorder.update(&entry).await {
                        tracing::warn!(sync_log_id = %entry.id, error = %update_err, "failed to close aborted sync log entry");
                    }
                }
                tracing::error!(connection_id = %entry.connection_id, error = %err, "sync cycle aborted");
                Err(err)
            }
        }
    }

    /// Queue a full publish of every mapped room type from today over the
    /// configured horizon.
    pub async fn trigger_full_sync(
        &self,
        connection_id: ConnectionId,
        priority: TaskPriority,
    ) -> Result<TaskId, OrchestratorError> {
        self.lane(connection_id)?;
        let today = Utc::now().date_naive();
        let horizon = chrono::Days::new(u64::from(self.full_sync_horizon_days));
        let range = StayRange::new(today, today + horizon)?;
        let task = self
            .queue
            .enqueue(PublishTaskInput {
                connection_id,
                kind: TaskKind::FullSync,
                priority,
                payload: TaskPayload {
                    room_scope: RoomScope::All,
                    range,
                },
            })
            .await?;
        tracing::info!(connection_id = %connection_id, task_id = %task.id, range = %range, "full sync queued");
        Ok(task.id)
    }

    pub async fn queue_snapshot(
        &self,
        connection_id: Option<ConnectionId>,
    ) -> Result<Vec<PublishTask>, OrchestratorError> {
        Ok(self.queue.snapshot(connection_id).await?)
    }

    pub async fn failed_tasks(
        &self,
        connection_id: Option<ConnectionId>,
    ) -> Result<Vec<PublishTask>, OrchestratorError> {
        Ok(self.queue.failed_tasks(connection_id).await?)
    }

    pub async fn retry_failed(&self, task_id: TaskId) -> Result<PublishTask, OrchestratorError> {
        Ok(self.queue.retry_failed(task_id).await?)
    }

    pub async fn sync_history(
        &self,
        connection_id: Option<ConnectionId>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>, OrchestratorError> {
        Ok(self.recorder.history(connection_id, limit).await?)
    }

    pub fn credit_status(&self, connection_id: ConnectionId) -> Result<Option<CreditState>, OrchestratorError> {
        Ok(self.lane(connection_id)?.client.credit_status())
    }

    pub fn paused_until(&self, connection_id: ConnectionId) -> Result<Option<DateTime<Utc>>, OrchestratorError> {
        Ok(self.lane(connection_id)?.paused_until())
    }
}
