//! Reservation lifecycle hook: status transitions to ledger holds, then
//! availability pushes for every connection selling the affected room type.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use innsync_core::{HotelId, ReservationId, RoomTypeId, StayRange, TaskId};
use innsync_inventory::{
    HoldOutcome, InsufficientInventory, LedgerEffect, ReleaseReport, ReservationSnapshot, StayHold,
};

use crate::config::ConnectionConfig;
use crate::ledger::{InventoryLedger, LedgerError};
use crate::queue::{PublishQueue, PublishTaskInput, RoomScope, TaskKind, TaskPayload, TaskPriority};

#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    /// The stay does not fit; the caller must reject the reservation.
    #[error(transparent)]
    Insufficient(InsufficientInventory),
    #[error(transparent)]
    Ledger(LedgerError),
}

impl From<LedgerError> for LifecycleError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Insufficient(e) => LifecycleError::Insufficient(e),
            other => LifecycleError::Ledger(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "change")]
pub enum LedgerChange {
    Held,
    AlreadyHeld,
    Moved { from: StayRange },
    Released { clamped_nights: usize },
    /// Cancellation of a reservation that held nothing.
    NothingHeld,
    /// The status carries no ledger effect.
    NoEffect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub reservation_id: ReservationId,
    pub change: LedgerChange,
    /// Availability tasks enqueued (or coalesced into).
    pub enqueued: Vec<TaskId>,
    /// Enqueues that failed after the ledger change committed. The periodic
    /// full sync republishes those ranges.
    pub enqueue_failures: usize,
}

struct Affected {
    hotel_id: HotelId,
    room_type_id: RoomTypeId,
    range: StayRange,
}

pub struct ReservationLifecycle {
    ledger: Arc<dyn InventoryLedger>,
    queue: Arc<dyn PublishQueue>,
    connections: Arc<Vec<ConnectionConfig>>,
}

impl ReservationLifecycle {
    pub fn new(
        ledger: Arc<dyn InventoryLedger>,
        queue: Arc<dyn PublishQueue>,
        connections: Arc<Vec<ConnectionConfig>>,
    ) -> Self {
        Self {
            ledger,
            queue,
            connections,
        }
    }

    /// Apply the ledger effect of `reservation`'s current status. Idempotent:
    /// repeating a transition changes nothing and enqueues nothing.
    pub async fn apply_transition(
        &self,
        reservation: &ReservationSnapshot,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let (change, affected) = match reservation.status.ledger_effect() {
            LedgerEffect::Hold => self.hold(reservation).await?,
            LedgerEffect::Release => self.release(reservation.id).await?,
            LedgerEffect::None => (LedgerChange::NoEffect, Vec::new()),
        };

        let mut outcome = TransitionOutcome {
            reservation_id: reservation.id,
            change,
            enqueued: Vec::new(),
            enqueue_failures: 0,
        };
        for range in affected {
            self.enqueue_availability(&range, &mut outcome).await;
        }

        tracing::info!(
            reservation_id = %reservation.id,
            status = %reservation.status,
            change = ?outcome.change,
            enqueued = outcome.enqueued.len(),
            "reservation transition applied"
        );
        Ok(outcome)
    }

    async fn hold(
        &self,
        reservation: &ReservationSnapshot,
    ) -> Result<(LedgerChange, Vec<Affected>), LifecycleError> {
        let hold = StayHold {
            reservation_id: reservation.id,
            hotel_id: reservation.hotel_id,
            room_type_id: reservation.room_type_id,
            stay: reservation.stay,
            held_at: Utc::now(),
        };
        let current = Affected {
            hotel_id: hold.hotel_id,
            room_type_id: hold.room_type_id,
            range: hold.stay,
        };

        match self.ledger.hold_for(hold).await? {
            HoldOutcome::Applied => Ok((LedgerChange::Held, vec![current])),
            HoldOutcome::AlreadyHeld => Ok((LedgerChange::AlreadyHeld, Vec::new())),
            HoldOutcome::Moved { previous } => {
                let change = LedgerChange::Moved { from: previous.stay };
                if previous.hotel_id == current.hotel_id && previous.room_type_id == current.room_type_id {
                    let range = previous.stay.cover(&current.range);
                    Ok((change, vec![Affected { range, ..current }]))
                } else {
                    let old = Affected {
                        hotel_id: previous.hotel_id,
                        room_type_id: previous.room_type_id,
                        range: previous.stay,
                    };
                    Ok((change, vec![old, current]))
                }
            }
        }
    }

    async fn release(
        &self,
        reservation_id: ReservationId,
    ) -> Result<(LedgerChange, Vec<Affected>), LifecycleError> {
        match self.ledger.release_hold(reservation_id).await? {
            Some((hold, report)) => Ok((
                LedgerChange::Released {
                    clamped_nights: clamped(&report),
                },
                vec![Affected {
                    hotel_id: hold.hotel_id,
                    room_type_id: hold.room_type_id,
                    range: hold.stay,
                }],
            )),
            None => Ok((LedgerChange::NothingHeld, Vec::new())),
        }
    }

    async fn enqueue_availability(&self, affected: &Affected, outcome: &mut TransitionOutcome) {
        for conn in self
            .connections
            .iter()
            .filter(|c| c.enabled && c.maps(affected.hotel_id, affected.room_type_id))
        {
            let input = PublishTaskInput {
                connection_id: conn.id,
                kind: TaskKind::Availability,
                priority: TaskPriority::Normal,
                payload: TaskPayload {
                    room_scope: RoomScope::RoomType(affected.room_type_id),
                    range: affected.range,
                },
            };
            match self.queue.enqueue(input).await {
                Ok(task) => outcome.enqueued.push(task.id),
                Err(err) => {
                    outcome.enqueue_failures += 1;
                    tracing::error!(
                        connection_id = %conn.id,
                        reservation_id = %outcome.reservation_id,
                        error = %err,
                        "failed to enqueue availability push after ledger change"
                    );
                }
            }
        }
    }
}

fn clamped(report: &ReleaseReport) -> usize {
    report.clamped.len()
}
