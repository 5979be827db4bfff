//! Postgres-backed inventory ledger.
//!
//! Every mutation runs in one transaction that locks the affected
//! `inventory_days` rows with `SELECT ... FOR UPDATE`, ordered by
//! (hotel, room type, date) so concurrent multi-night reserves acquire locks
//! in the same order. A rejected reserve or move rolls back, leaving every
//! night as it was.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use innsync_core::{HotelId, ReservationId, RoomTypeId, StayRange};
use innsync_inventory::{
    HoldOutcome, InsufficientInventory, InventoryDay, InventoryDayLoad, InventoryKey,
    ReleaseReport, Restrictions, StayHold,
};

use super::{InventoryLedger, LedgerError};

const DAY_COLUMNS: &str = "hotel_id, room_type_id, date, allotment, reserved, min_stay, max_stay, \
     closed_to_arrival, closed_to_departure, stop_sell, updated_at";

type Tx = Transaction<'static, Postgres>;

#[derive(Debug, Clone)]
pub struct PostgresInventoryLedger {
    pool: Arc<PgPool>,
}

impl PostgresInventoryLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn begin(&self) -> Result<Tx, LedgerError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

async fn commit(tx: Tx) -> Result<(), LedgerError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

async fn rollback(tx: Tx) -> Result<(), LedgerError> {
    tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
}

/// Lock the loaded rows of `stay`, ascending by date.
async fn lock_days(
    tx: &mut Tx,
    hotel_id: HotelId,
    room_type_id: RoomTypeId,
    stay: &StayRange,
) -> Result<Vec<InventoryDay>, LedgerError> {
    let rows = sqlx::query(&format!(
        "SELECT {DAY_COLUMNS} FROM inventory_days \
         WHERE hotel_id = $1 AND room_type_id = $2 AND date >= $3 AND date < $4 \
         ORDER BY date ASC \
         FOR UPDATE"
    ))
    .bind(hotel_id.as_uuid())
    .bind(room_type_id.as_uuid())
    .bind(stay.check_in())
    .bind(stay.check_out())
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_days", e))?;

    rows.iter().map(day_from_row).collect()
}

/// First night of `stay` without a sellable unit, if any.
fn first_shortfall(
    days: &[InventoryDay],
    hotel_id: HotelId,
    room_type_id: RoomTypeId,
    stay: &StayRange,
) -> Option<InsufficientInventory> {
    let by_date: HashMap<NaiveDate, &InventoryDay> = days.iter().map(|d| (d.key.date, d)).collect();
    stay.dates().find_map(|date| match by_date.get(&date) {
        Some(day) if day.can_reserve() => None,
        Some(day) => Some(day.insufficient()),
        None => Some(InsufficientInventory {
            hotel_id,
            room_type_id,
            date,
            available: 0,
        }),
    })
}

/// Check and take one unit on every night of `stay`. Rows must already be
/// locked by the caller's transaction.
async fn take_range(
    tx: &mut Tx,
    hotel_id: HotelId,
    room_type_id: RoomTypeId,
    stay: &StayRange,
) -> Result<(), LedgerError> {
    let days = lock_days(tx, hotel_id, room_type_id, stay).await?;
    if let Some(shortfall) = first_shortfall(&days, hotel_id, room_type_id, stay) {
        return Err(shortfall.into());
    }

    sqlx::query(
        r#"
        UPDATE inventory_days
        SET allotment = allotment - 1, reserved = reserved + 1, updated_at = $5
        WHERE hotel_id = $1 AND room_type_id = $2 AND date >= $3 AND date < $4
        "#,
    )
    .bind(hotel_id.as_uuid())
    .bind(room_type_id.as_uuid())
    .bind(stay.check_in())
    .bind(stay.check_out())
    .bind(Utc::now())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("take_range", e))?;
    Ok(())
}

async fn give_back_range(
    tx: &mut Tx,
    hotel_id: HotelId,
    room_type_id: RoomTypeId,
    stay: &StayRange,
) -> Result<ReleaseReport, LedgerError> {
    lock_days(tx, hotel_id, room_type_id, stay).await?;

    let rows = sqlx::query(
        r#"
        UPDATE inventory_days
        SET allotment = allotment + 1, reserved = reserved - 1, updated_at = $5
        WHERE hotel_id = $1 AND room_type_id = $2 AND date >= $3 AND date < $4
          AND reserved > 0
        RETURNING date
        "#,
    )
    .bind(hotel_id.as_uuid())
    .bind(room_type_id.as_uuid())
    .bind(stay.check_in())
    .bind(stay.check_out())
    .bind(Utc::now())
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("give_back_range", e))?;

    let mut released = Vec::with_capacity(rows.len());
    for row in &rows {
        released.push(
            row.try_get::<NaiveDate, _>("date")
                .map_err(|e| map_sqlx_error("give_back_range", e))?,
        );
    }

    let mut report = ReleaseReport::default();
    for date in stay.dates() {
        if released.contains(&date) {
            report.released.push(date);
        } else {
            report.clamped.push(date);
        }
    }
    if !report.is_clean() {
        tracing::warn!(
            hotel_id = %hotel_id,
            room_type_id = %room_type_id,
            stay = %stay,
            clamped = report.clamped.len(),
            "release touched nights with nothing held"
        );
    }
    Ok(report)
}

#[async_trait::async_trait]
impl InventoryLedger for PostgresInventoryLedger {
    #[instrument(skip(self), fields(hotel_id = %hotel_id, room_type_id = %room_type_id, stay = %stay), err)]
    async fn reserve(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        stay: StayRange,
    ) -> Result<(), LedgerError> {
        let mut tx = self.begin().await?;
        match take_range(&mut tx, hotel_id, room_type_id, &stay).await {
            Ok(()) => commit(tx).await,
            Err(err) => {
                rollback(tx).await?;
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(hotel_id = %hotel_id, room_type_id = %room_type_id, stay = %stay), err)]
    async fn release(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        stay: StayRange,
    ) -> Result<ReleaseReport, LedgerError> {
        let mut tx = self.begin().await?;
        let report = give_back_range(&mut tx, hotel_id, room_type_id, &stay).await?;
        commit(tx).await?;
        Ok(report)
    }

    async fn get_availability(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        date: NaiveDate,
    ) -> Result<Option<InventoryDay>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {DAY_COLUMNS} FROM inventory_days \
             WHERE hotel_id = $1 AND room_type_id = $2 AND date = $3"
        ))
        .bind(hotel_id.as_uuid())
        .bind(room_type_id.as_uuid())
        .bind(date)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_availability", e))?;

        row.as_ref().map(day_from_row).transpose()
    }

    async fn availability_range(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        range: StayRange,
    ) -> Result<Vec<InventoryDay>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {DAY_COLUMNS} FROM inventory_days \
             WHERE hotel_id = $1 AND room_type_id = $2 AND date >= $3 AND date < $4 \
             ORDER BY date ASC"
        ))
        .bind(hotel_id.as_uuid())
        .bind(room_type_id.as_uuid())
        .bind(range.check_in())
        .bind(range.check_out())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("availability_range", e))?;

        rows.iter().map(day_from_row).collect()
    }

    #[instrument(skip(self, load), fields(room_type_id = %load.key.room_type_id, date = %load.key.date), err)]
    async fn load_day(&self, load: InventoryDayLoad) -> Result<InventoryDay, LedgerError> {
        let r = &load.restrictions;
        let row = sqlx::query(&format!(
            "INSERT INTO inventory_days ( \
                 hotel_id, room_type_id, date, allotment, reserved, min_stay, max_stay, \
                 closed_to_arrival, closed_to_departure, stop_sell, updated_at \
             ) \
             VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (hotel_id, room_type_id, date) DO UPDATE SET \
                 allotment = EXCLUDED.allotment, \
                 min_stay = EXCLUDED.min_stay, \
                 max_stay = EXCLUDED.max_stay, \
                 closed_to_arrival = EXCLUDED.closed_to_arrival, \
                 closed_to_departure = EXCLUDED.closed_to_departure, \
                 stop_sell = EXCLUDED.stop_sell, \
                 updated_at = EXCLUDED.updated_at \
             RETURNING {DAY_COLUMNS}"
        ))
        .bind(load.key.hotel_id.as_uuid())
        .bind(load.key.room_type_id.as_uuid())
        .bind(load.key.date)
        .bind(to_i32(load.allotment))
        .bind(to_i32(r.min_stay))
        .bind(r.max_stay.map(to_i32))
        .bind(r.closed_to_arrival)
        .bind(r.closed_to_departure)
        .bind(r.stop_sell)
        .bind(Utc::now())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_day", e))?;

        day_from_row(&row)
    }

    #[instrument(skip(self, hold), fields(reservation_id = %hold.reservation_id, stay = %hold.stay), err)]
    async fn hold_for(&self, hold: StayHold) -> Result<HoldOutcome, LedgerError> {
        let mut tx = self.begin().await?;
        let previous = lock_hold(&mut tx, hold.reservation_id).await?;

        if let Some(existing) = &previous {
            if existing.covers_same(&hold) {
                commit(tx).await?;
                return Ok(HoldOutcome::AlreadyHeld);
            }
        }

        let result: Result<(), LedgerError> = async {
            if let Some(previous) = &previous {
                // Lock both ranges in key order before touching either.
                let mut ranges = [
                    (previous.hotel_id, previous.room_type_id, previous.stay),
                    (hold.hotel_id, hold.room_type_id, hold.stay),
                ];
                ranges.sort_by_key(|(h, r, s)| (*h, *r, s.check_in()));
                for (h, r, s) in &ranges {
                    lock_days(&mut tx, *h, *r, s).await?;
                }
                give_back_range(&mut tx, previous.hotel_id, previous.room_type_id, &previous.stay)
                    .await?;
            }
            take_range(&mut tx, hold.hotel_id, hold.room_type_id, &hold.stay).await?;
            upsert_hold(&mut tx, &hold).await
        }
        .await;

        match result {
            Ok(()) => {
                commit(tx).await?;
                Ok(match previous {
                    Some(previous) => HoldOutcome::Moved { previous },
                    None => HoldOutcome::Applied,
                })
            }
            Err(err) => {
                rollback(tx).await?;
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(reservation_id = %reservation_id), err)]
    async fn release_hold(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<(StayHold, ReleaseReport)>, LedgerError> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            r#"
            DELETE FROM reservation_holds
            WHERE reservation_id = $1
            RETURNING reservation_id, hotel_id, room_type_id, check_in, check_out, held_at
            "#,
        )
        .bind(reservation_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("release_hold", e))?;

        let Some(row) = row else {
            commit(tx).await?;
            return Ok(None);
        };
        let hold = hold_from_row(&row)?;
        let report = give_back_range(&mut tx, hold.hotel_id, hold.room_type_id, &hold.stay).await?;
        commit(tx).await?;
        Ok(Some((hold, report)))
    }

    async fn get_hold(&self, reservation_id: ReservationId) -> Result<Option<StayHold>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT reservation_id, hotel_id, room_type_id, check_in, check_out, held_at
            FROM reservation_holds
            WHERE reservation_id = $1
            "#,
        )
        .bind(reservation_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_hold", e))?;

        row.as_ref().map(hold_from_row).transpose()
    }
}

async fn lock_hold(tx: &mut Tx, reservation_id: ReservationId) -> Result<Option<StayHold>, LedgerError> {
    let row = sqlx::query(
        r#"
        SELECT reservation_id, hotel_id, room_type_id, check_in, check_out, held_at
        FROM reservation_holds
        WHERE reservation_id = $1
        FOR UPDATE
        "#,
    )
    .bind(reservation_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_hold", e))?;

    row.as_ref().map(hold_from_row).transpose()
}

async fn upsert_hold(tx: &mut Tx, hold: &StayHold) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO reservation_holds (reservation_id, hotel_id, room_type_id, check_in, check_out, held_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (reservation_id) DO UPDATE SET
            hotel_id = EXCLUDED.hotel_id,
            room_type_id = EXCLUDED.room_type_id,
            check_in = EXCLUDED.check_in,
            check_out = EXCLUDED.check_out,
            held_at = EXCLUDED.held_at
        "#,
    )
    .bind(hold.reservation_id.as_uuid())
    .bind(hold.hotel_id.as_uuid())
    .bind(hold.room_type_id.as_uuid())
    .bind(hold.stay.check_in())
    .bind(hold.stay.check_out())
    .bind(hold.held_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("upsert_hold", e))?;
    Ok(())
}

fn to_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

fn to_u32(v: i32) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

fn day_from_row(row: &PgRow) -> Result<InventoryDay, LedgerError> {
    let decode = |e: sqlx::Error| LedgerError::Storage(format!("failed to decode inventory day: {e}"));
    let max_stay: Option<i32> = row.try_get("max_stay").map_err(decode)?;
    Ok(InventoryDay {
        key: InventoryKey::new(
            HotelId::from_uuid(row.try_get("hotel_id").map_err(decode)?),
            RoomTypeId::from_uuid(row.try_get("room_type_id").map_err(decode)?),
            row.try_get("date").map_err(decode)?,
        ),
        allotment: to_u32(row.try_get("allotment").map_err(decode)?),
        reserved: to_u32(row.try_get("reserved").map_err(decode)?),
        restrictions: Restrictions {
            min_stay: to_u32(row.try_get("min_stay").map_err(decode)?),
            max_stay: max_stay.map(to_u32),
            closed_to_arrival: row.try_get("closed_to_arrival").map_err(decode)?,
            closed_to_departure: row.try_get("closed_to_departure").map_err(decode)?,
            stop_sell: row.try_get("stop_sell").map_err(decode)?,
        },
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(decode)?,
    })
}

fn hold_from_row(row: &PgRow) -> Result<StayHold, LedgerError> {
    let decode = |e: sqlx::Error| LedgerError::Storage(format!("failed to decode hold: {e}"));
    let stay = StayRange::new(
        row.try_get("check_in").map_err(decode)?,
        row.try_get("check_out").map_err(decode)?,
    )
    .map_err(|e| LedgerError::Storage(format!("stored hold range is invalid: {e}")))?;
    Ok(StayHold {
        reservation_id: ReservationId::from_uuid(row.try_get("reservation_id").map_err(decode)?),
        hotel_id: HotelId::from_uuid(row.try_get("hotel_id").map_err(decode)?),
        room_type_id: RoomTypeId::from_uuid(row.try_get("room_type_id").map_err(decode)?),
        stay,
        held_at: row.try_get("held_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            LedgerError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        other => LedgerError::Storage(format!("{operation}: {other}")),
    }
}
