//! Integration tests for the sync pipeline.
//!
//! Tests: Lifecycle → Ledger → Queue → Orchestrator → Channel → Sync Log
//!
//! Verifies:
//! - Allotment follows reservation transitions and never goes negative
//! - Ledger changes fan out as coalesced availability pushes
//! - Credit telemetry throttles pushes; rate limits requeue without cost
//! - Pull conflicts surface as reconciliation errors, never auto-resolved

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::Instant;

    use innsync_core::StayRange;
    use innsync_inventory::ReservationStatus;

    use crate::channel::ChannelType;
    use crate::ledger::InventoryLedger;
    use crate::lifecycle::{LedgerChange, LifecycleError};
    use crate::orchestrator::CycleOutcome;
    use crate::queue::{PublishQueue, RetryPolicy, RoomScope, TaskKind, TaskStatus};
    use crate::sync_log::{ErrorKind, SyncLogEntry, SyncLogError, SyncLogRecorder, SyncStatus};
    use crate::testing::{Harness, ScriptedReply, date};

    fn ack() -> ScriptedReply {
        ScriptedReply::ok().json(json!({"success": true}))
    }

    fn ran(outcome: CycleOutcome) -> SyncLogEntry {
        match outcome {
            CycleOutcome::Ran { entry } => entry,
            other => panic!("expected a cycle to run, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn allotment_follows_confirm_cancel_and_retry() {
        let h = Harness::new(RetryPolicy::default());
        let lifecycle = h.orchestrator.lifecycle();
        h.load("2024-06-01", 1).await;

        let mut a = h.reservation("2024-06-01", "2024-06-02", ReservationStatus::Confirmed);
        let b = h.reservation("2024-06-01", "2024-06-02", ReservationStatus::Confirmed);

        let outcome = lifecycle.apply_transition(&a).await.unwrap();
        assert_eq!(outcome.change, LedgerChange::Held);
        assert_eq!(h.allotment("2024-06-01").await, 0);

        let err = lifecycle.apply_transition(&b).await.unwrap_err();
        let LifecycleError::Insufficient(conflict) = err else {
            panic!("expected insufficient inventory");
        };
        assert_eq!(conflict.date, date("2024-06-01"));
        assert_eq!(h.allotment("2024-06-01").await, 0);

        a.status = ReservationStatus::Cancelled;
        let outcome = lifecycle.apply_transition(&a).await.unwrap();
        assert!(matches!(outcome.change, LedgerChange::Released { clamped_nights: 0 }));
        assert_eq!(h.allotment("2024-06-01").await, 1);

        lifecycle.apply_transition(&b).await.unwrap();
        assert_eq!(h.allotment("2024-06-01").await, 0);

        // Every change targeted the same night, so the pushes coalesced.
        let queued = h.queue.snapshot(Some(h.connection_id())).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, TaskKind::Availability);
        assert_eq!(queued[0].payload.room_scope, RoomScope::RoomType(h.room_type_id));
    }

    #[tokio::test]
    async fn repeated_confirm_holds_once() {
        let h = Harness::new(RetryPolicy::default());
        let lifecycle = h.orchestrator.lifecycle();
        h.load("2024-06-01", 3).await;
        h.load("2024-06-02", 3).await;

        let a = h.reservation("2024-06-01", "2024-06-03", ReservationStatus::Confirmed);
        lifecycle.apply_transition(&a).await.unwrap();
        let again = lifecycle.apply_transition(&a).await.unwrap();

        assert_eq!(again.change, LedgerChange::AlreadyHeld);
        assert!(again.enqueued.is_empty());
        assert_eq!(h.allotment("2024-06-01").await, 2);
        assert_eq!(h.allotment("2024-06-02").await, 2);
    }

    #[tokio::test]
    async fn moved_stay_pushes_union_of_ranges() {
        let h = Harness::new(RetryPolicy::default());
        let lifecycle = h.orchestrator.lifecycle();
        for day in ["2024-06-01", "2024-06-02", "2024-06-03", "2024-06-04"] {
            h.load(day, 2).await;
        }

        let mut a = h.reservation("2024-06-01", "2024-06-03", ReservationStatus::Confirmed);
        lifecycle.apply_transition(&a).await.unwrap();
        a.stay = StayRange::new(date("2024-06-02"), date("2024-06-05")).unwrap();
        let outcome = lifecycle.apply_transition(&a).await.unwrap();

        assert!(matches!(outcome.change, LedgerChange::Moved { .. }));
        assert_eq!(h.allotment("2024-06-01").await, 2);
        assert_eq!(h.allotment("2024-06-04").await, 1);

        let task = h.queue.get(outcome.enqueued[0]).await.unwrap().unwrap();
        assert_eq!(
            task.payload.range,
            StayRange::new(date("2024-06-01"), date("2024-06-05")).unwrap()
        );
    }

    #[tokio::test]
    async fn non_holding_statuses_leave_the_ledger_alone() {
        let h = Harness::new(RetryPolicy::default());
        h.load("2024-06-01", 1).await;
        let pending = h.reservation("2024-06-01", "2024-06-02", ReservationStatus::Pending);

        let outcome = h.orchestrator.lifecycle().apply_transition(&pending).await.unwrap();
        assert_eq!(outcome.change, LedgerChange::NoEffect);
        assert_eq!(h.allotment("2024-06-01").await, 1);
        assert!(h.queue.snapshot(None).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn low_credit_throttles_the_next_push() {
        let h = Harness::new(RetryPolicy::default());
        h.load("2024-06-01", 5).await;
        h.load("2024-06-02", 5).await;
        h.enqueue(TaskKind::Availability, "2024-06-01").await;
        h.enqueue(TaskKind::Availability, "2024-06-02").await;
        h.transport.push(ack().credits(8, 600));
        h.transport.push(ack().credits(500, 600));
        h.transport.push(ack().credits(499, 600));

        let started = Instant::now();
        let entry = ran(h.orchestrator.push_cycle(h.connection_id()).await.unwrap());
        let waited = started.elapsed();
        assert_eq!(entry.records_succeeded, 2);
        assert!(waited >= Duration::from_secs(600) && waited < Duration::from_secs(601));

        h.enqueue(TaskKind::Availability, "2024-06-01").await;
        let started = Instant::now();
        ran(h.orchestrator.push_cycle(h.connection_id()).await.unwrap());
        assert!(started.elapsed() < Duration::from_millis(1));
        assert_eq!(h.orchestrator.credit_status(h.connection_id()).unwrap().unwrap().remaining, 499);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_requeue_keeps_attempt_count() {
        let h = Harness::new(RetryPolicy::fixed(5, Duration::ZERO));
        let task = h.enqueue(TaskKind::Availability, "2024-06-01").await;
        h.transport.push(ScriptedReply::status(502));
        h.transport.push(ScriptedReply::status(429).credits(0, 120));

        ran(h.orchestrator.push_cycle(h.connection_id()).await.unwrap());
        assert_eq!(h.queue.get(task.id).await.unwrap().unwrap().attempts, 1);

        let entry = ran(h.orchestrator.push_cycle(h.connection_id()).await.unwrap());
        assert_eq!(entry.records_requeued, 1);
        let task = h.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_ceiling_yields_permanent_failure_until_operator_retry() {
        let h = Harness::new(RetryPolicy::fixed(2, Duration::ZERO));
        let task = h.enqueue(TaskKind::Rate, "2024-06-01").await;
        h.transport.push(ScriptedReply::status(500));
        h.transport.push(ScriptedReply::status(500));

        let first = ran(h.orchestrator.push_cycle(h.connection_id()).await.unwrap());
        assert_eq!(first.error_details[0].kind, ErrorKind::Transport);
        let second = ran(h.orchestrator.push_cycle(h.connection_id()).await.unwrap());
        assert_eq!(second.error_details[0].kind, ErrorKind::PermanentFailure);

        assert_eq!(h.orchestrator.push_cycle(h.connection_id()).await.unwrap(), CycleOutcome::Idle);
        let failed = h.orchestrator.failed_tasks(None).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 2);

        let retried = h.orchestrator.retry_failed(task.id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Queued);
        assert_eq!(retried.attempts, 0);
        assert!(h.orchestrator.failed_tasks(None).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pulled_booking_conflict_is_recorded_not_resolved() {
        let h = Harness::new(RetryPolicy::default());
        h.load("2024-06-01", 1).await;
        let internal = h.reservation("2024-06-01", "2024-06-02", ReservationStatus::Confirmed);
        h.orchestrator.lifecycle().apply_transition(&internal).await.unwrap();

        h.transport.push(ScriptedReply::ok().json(json!({
            "bookings": [{
                "id": "CM-42",
                "room_code": "DBL",
                "arrival": "2024-06-01",
                "departure": "2024-06-02",
                "status": "confirmed"
            }]
        })));
        let entry = ran(
            h.orchestrator
                .pull_cycle(h.connection_id(), crate::channel::PullMode::New)
                .await
                .unwrap(),
        );

        assert_eq!(entry.status, SyncStatus::Failed);
        assert_eq!(entry.records_failed, 1);
        let detail = &entry.error_details[0];
        assert_eq!(detail.kind, ErrorKind::ReconciliationConflict);
        assert_eq!(detail.external_id.as_deref(), Some("CM-42"));
        assert_eq!(detail.date, Some(date("2024-06-01")));

        assert_eq!(h.allotment("2024-06-01").await, 0);
        assert!(h.ledger.get_hold(internal.id).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn pulled_bookings_hold_and_release_inventory() {
        let h = Harness::with_channel(ChannelType::Ota, RetryPolicy::default());
        h.load("2024-06-01", 2).await;
        h.load("2024-06-02", 2).await;

        let booking = |state: &str| {
            ScriptedReply::ok().json(json!({
                "reservations": [{
                    "reservationId": "OTA-7",
                    "roomId": "DBL",
                    "checkIn": "2024-06-01",
                    "checkOut": "2024-06-03",
                    "state": state
                }]
            }))
        };
        h.transport.push(booking("BOOKED"));
        h.transport.push(booking("CANCELLED"));

        let entry = ran(
            h.orchestrator
                .pull_cycle(h.connection_id(), crate::channel::PullMode::New)
                .await
                .unwrap(),
        );
        assert_eq!(entry.status, SyncStatus::Completed);
        assert_eq!(entry.records_succeeded, 1);
        assert_eq!(h.allotment("2024-06-01").await, 1);
        assert_eq!(h.allotment("2024-06-02").await, 1);
        assert_eq!(h.queue.snapshot(Some(h.connection_id())).await.unwrap().len(), 1);

        ran(h.orchestrator
            .pull_cycle(h.connection_id(), crate::channel::PullMode::New)
            .await
            .unwrap());
        assert_eq!(h.allotment("2024-06-01").await, 2);
        assert_eq!(h.allotment("2024-06-02").await, 2);
    }

    #[tokio::test]
    async fn repulled_booking_after_restart_is_not_held_twice() {
        let h = Harness::new(RetryPolicy::default());
        h.load("2024-06-01", 3).await;
        let confirmed = || {
            ScriptedReply::ok().json(json!({
                "bookings": [{
                    "id": "CM-1",
                    "room_code": "DBL",
                    "arrival": "2024-06-01",
                    "departure": "2024-06-02",
                    "status": "confirmed"
                }]
            }))
        };

        h.transport.push(confirmed());
        ran(h.orchestrator
            .pull_cycle(h.connection_id(), crate::channel::PullMode::New)
            .await
            .unwrap());
        assert_eq!(h.allotment("2024-06-01").await, 2);

        let restarted = h.restart();
        restarted.transport.push(confirmed());
        let entry = ran(restarted
            .orchestrator
            .pull_cycle(h.connection_id(), crate::channel::PullMode::New)
            .await
            .unwrap());
        assert_eq!(entry.records_succeeded, 1);
        assert_eq!(h.allotment("2024-06-01").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_cycle_entries_are_immutable() {
        let h = Harness::new(RetryPolicy::default());
        h.enqueue(TaskKind::Availability, "2024-06-01").await;
        h.transport.push(ack());

        let mut entry = ran(h.orchestrator.push_cycle(h.connection_id()).await.unwrap());
        assert!(entry.completed_at.is_some());
        assert!(matches!(entry.record_success(), Err(SyncLogError::Closed(_))));

        let mut tampered = entry.clone();
        tampered.completed_at = None;
        tampered.records_processed += 10;
        assert!(matches!(h.recorder.update(&tampered).await, Err(SyncLogError::Closed(_))));

        let stored = h.recorder.get(entry.id).await.unwrap().unwrap();
        assert_eq!(stored, entry);
        let history = h.orchestrator.sync_history(Some(h.connection_id()), 10).await.unwrap();
        assert_eq!(history[0].id, entry.id);
    }
}
