//! Periodic driver for the orchestrator.
//!
//! One loop with three intervals (push, pull, full sync). Each tick spawns
//! one task per enabled connection, so connections progress independently;
//! the orchestrator serializes cycles within a connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use innsync_core::ConnectionId;

use crate::config::SchedulerConfig;
use crate::orchestrator::{CycleOutcome, SyncOrchestrator};
use crate::queue::TaskPriority;

pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    config: SchedulerConfig,
}

/// Handle to a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop ticking and wait for in-flight cycles (bounded by the configured
    /// grace period).
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "sync scheduler task failed");
        }
    }
}

fn interval(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, config: SchedulerConfig) -> Self {
        Self { orchestrator, config }
    }

    pub fn spawn(self) -> SchedulerHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let join = tokio::spawn(self.run(signal));
        SchedulerHandle { shutdown, join }
    }

    async fn run(self, shutdown: Arc<Notify>) {
        let connections = self.orchestrator.connection_ids();
        tracing::info!(
            connections = connections.len(),
            push_interval_secs = self.config.push_interval_secs,
            pull_interval_secs = self.config.pull_interval_secs,
            full_sync_interval_secs = self.config.full_sync_interval_secs,
            "sync scheduler started"
        );

        let mut push = interval(self.config.push_interval_secs);
        let mut pull = interval(self.config.pull_interval_secs);
        let mut full_sync = interval(self.config.full_sync_interval_secs);
        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::info!("sync scheduler received shutdown signal");
                    break;
                }
                _ = push.tick() => {
                    for &connection_id in &connections {
                        cycles.spawn(push_connection(self.orchestrator.clone(), connection_id));
                    }
                }
                _ = pull.tick() => {
                    for &connection_id in &connections {
                        cycles.spawn(pull_connection(self.orchestrator.clone(), connection_id));
                    }
                }
                _ = full_sync.tick() => {
                    for &connection_id in &connections {
                        let orchestrator = self.orchestrator.clone();
                        cycles.spawn(async move {
                            if let Err(err) = orchestrator.trigger_full_sync(connection_id, TaskPriority::Low).await {
                                tracing::error!(connection_id = %connection_id, error = %err, "failed to queue full sync");
                            }
                        });
                    }
                }
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "sync cycle task panicked");
                    }
                }
            }
        }

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while cycles.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                in_flight = cycles.len(),
                grace_secs = grace.as_secs(),
                "aborting sync cycles still running after shutdown grace period"
            );
            cycles.abort_all();
        }
        tracing::info!("sync scheduler stopped");
    }
}

async fn push_connection(orchestrator: Arc<SyncOrchestrator>, connection_id: ConnectionId) {
    match orchestrator.push_cycle(connection_id).await {
        Ok(CycleOutcome::Busy) => {
            tracing::debug!(connection_id = %connection_id, "push skipped; connection busy");
        }
        Ok(_) => {}
        Err(err) => {
            tracing::error!(connection_id = %connection_id, error = %err, "push cycle failed");
        }
    }
}

async fn pull_connection(orchestrator: Arc<SyncOrchestrator>, connection_id: ConnectionId) {
    let modes = match orchestrator.pull_modes(connection_id) {
        Ok(modes) => modes,
        Err(err) => {
            tracing::error!(connection_id = %connection_id, error = %err, "pull cycle failed");
            return;
        }
    };
    for mode in modes {
        match orchestrator.pull_cycle(connection_id, mode).await {
            Ok(CycleOutcome::Paused { until }) => {
                tracing::debug!(connection_id = %connection_id, until = %until, "pull stopped; connection paused");
                return;
            }
            Ok(CycleOutcome::Busy) => {
                tracing::debug!(connection_id = %connection_id, mode = mode.as_str(), "pull skipped; connection busy");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(connection_id = %connection_id, mode = mode.as_str(), error = %err, "pull cycle failed");
            }
        }
    }
}
