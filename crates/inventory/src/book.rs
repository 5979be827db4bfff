//! In-process inventory book: days plus reservation holds.
//!
//! The book is the all-or-nothing engine shared by the in-memory ledger (which
//! wraps it in a mutex) and by tests. Every mutating method either applies to
//! every night of the stay or to none of them.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use innsync_core::{HotelId, ReservationId, RoomTypeId, StayRange};

use crate::day::{InventoryDay, InventoryDayLoad, InventoryKey, ReleaseEffect};
use crate::error::InsufficientInventory;

/// A reservation's claim on inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayHold {
    pub reservation_id: ReservationId,
    pub hotel_id: HotelId,
    pub room_type_id: RoomTypeId,
    pub stay: StayRange,
    pub held_at: DateTime<Utc>,
}

impl StayHold {
    /// Same room type and nights (ignores `held_at`).
    pub fn covers_same(&self, other: &StayHold) -> bool {
        self.hotel_id == other.hotel_id
            && self.room_type_id == other.room_type_id
            && self.stay == other.stay
    }
}

/// Result of `hold_for`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldOutcome {
    /// New hold, allotment decremented.
    Applied,
    /// Identical hold already present; nothing changed.
    AlreadyHeld,
    /// The reservation moved: the previous hold was given back and the new
    /// stay taken, as one step.
    Moved { previous: StayHold },
}

impl HoldOutcome {
    pub fn changed_inventory(&self) -> bool {
        !matches!(self, HoldOutcome::AlreadyHeld)
    }
}

/// Per-night outcome of a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReport {
    pub released: Vec<NaiveDate>,
    /// Nights with nothing held (or never loaded); left untouched.
    pub clamped: Vec<NaiveDate>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.clamped.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InventoryBook {
    days: BTreeMap<InventoryKey, InventoryDay>,
    holds: HashMap<ReservationId, StayHold>,
}

impl InventoryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, load: &InventoryDayLoad, now: DateTime<Utc>) -> InventoryDay {
        let day = self
            .days
            .entry(load.key)
            .and_modify(|d| d.apply_load(load, now))
            .or_insert_with(|| InventoryDay::from_load(load, now));
        day.clone()
    }

    pub fn day(&self, key: &InventoryKey) -> Option<&InventoryDay> {
        self.days.get(key)
    }

    /// Loaded days of the room type within `stay`, ascending.
    pub fn range(&self, hotel_id: HotelId, room_type_id: RoomTypeId, stay: &StayRange) -> Vec<InventoryDay> {
        let from = InventoryKey::new(hotel_id, room_type_id, stay.check_in());
        let to = InventoryKey::new(hotel_id, room_type_id, stay.check_out());
        self.days.range(from..to).map(|(_, d)| d.clone()).collect()
    }

    /// Verify every night has capacity without mutating anything.
    pub fn check_reserve(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        stay: &StayRange,
    ) -> Result<(), InsufficientInventory> {
        for date in stay.dates() {
            let key = InventoryKey::new(hotel_id, room_type_id, date);
            match self.days.get(&key) {
                Some(day) if day.can_reserve() => {}
                Some(day) => return Err(day.insufficient()),
                None => {
                    return Err(InsufficientInventory {
                        hotel_id,
                        room_type_id,
                        date,
                        available: 0,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn reserve(
        &mut self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        stay: &StayRange,
        now: DateTime<Utc>,
    ) -> Result<(), InsufficientInventory> {
        self.check_reserve(hotel_id, room_type_id, stay)?;
        for date in stay.dates() {
            let key = InventoryKey::new(hotel_id, room_type_id, date);
            if let Some(day) = self.days.get_mut(&key) {
                day.take_one(now)?;
            }
        }
        Ok(())
    }

    pub fn release(
        &mut self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        stay: &StayRange,
        now: DateTime<Utc>,
    ) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for date in stay.dates() {
            let key = InventoryKey::new(hotel_id, room_type_id, date);
            let effect = match self.days.get_mut(&key) {
                Some(day) => day.give_back_one(now),
                None => ReleaseEffect::Clamped,
            };
            match effect {
                ReleaseEffect::Released => report.released.push(date),
                ReleaseEffect::Clamped => report.clamped.push(date),
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
        report
    }

    pub fn hold(&self, reservation_id: &ReservationId) -> Option<&StayHold> {
        self.holds.get(reservation_id)
    }

    pub fn holds(&self) -> impl Iterator<Item = &StayHold> {
        self.holds.values()
    }

    /// Idempotently make `hold` the reservation's claim on inventory.
    pub fn hold_for(
        &mut self,
        hold: StayHold,
        now: DateTime<Utc>,
    ) -> Result<HoldOutcome, InsufficientInventory> {
        let previous = match self.holds.get(&hold.reservation_id) {
            Some(existing) if existing.covers_same(&hold) => return Ok(HoldOutcome::AlreadyHeld),
            Some(existing) => Some(existing.clone()),
            None => None,
        };

        let Some(previous) = previous else {
            self.reserve(hold.hotel_id, hold.room_type_id, &hold.stay, now)?;
            self.holds.insert(hold.reservation_id, hold);
            return Ok(HoldOutcome::Applied);
        };

        // Give the old nights back first so an overlapping move can reuse them,
        // then restore them if the new stay does not fit.
        self.release(previous.hotel_id, previous.room_type_id, &previous.stay, now);
        if let Err(err) = self.reserve(hold.hotel_id, hold.room_type_id, &hold.stay, now) {
            if let Err(restore) =
                self.reserve(previous.hotel_id, previous.room_type_id, &previous.stay, now)
            {
                tracing::error!(
                    reservation_id = %previous.reservation_id,
                    error = %restore,
                    "could not restore hold after rejected move; dropping it"
                );
                self.holds.remove(&previous.reservation_id);
            }
            return Err(err);
        }
        self.holds.insert(hold.reservation_id, hold);
        Ok(HoldOutcome::Moved { previous })
    }

    /// Drop the reservation's hold, giving its nights back.
    pub fn release_hold(
        &mut self,
        reservation_id: &ReservationId,
        now: DateTime<Utc>,
    ) -> Option<(StayHold, ReleaseReport)> {
        let hold = self.holds.remove(reservation_id)?;
        let report = self.release(hold.hotel_id, hold.room_type_id, &hold.stay, now);
        Some((hold, report))
    }
}
