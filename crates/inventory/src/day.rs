use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use innsync_core::{HotelId, RoomTypeId};

use crate::error::InsufficientInventory;

/// Key of one inventory day.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InventoryKey {
    pub hotel_id: HotelId,
    pub room_type_id: RoomTypeId,
    pub date: NaiveDate,
}

impl InventoryKey {
    pub fn new(hotel_id: HotelId, room_type_id: RoomTypeId, date: NaiveDate) -> Self {
        Self {
            hotel_id,
            room_type_id,
            date,
        }
    }
}

/// Sale restrictions published alongside availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restrictions {
    pub min_stay: u32,
    pub max_stay: Option<u32>,
    pub closed_to_arrival: bool,
    pub closed_to_departure: bool,
    pub stop_sell: bool,
}

impl Default for Restrictions {
    fn default() -> Self {
        Self {
            min_stay: 1,
            max_stay: None,
            closed_to_arrival: false,
            closed_to_departure: false,
            stop_sell: false,
        }
    }
}

/// Inbound rate/availability load for one date.
///
/// The only path besides reserve/release that touches an allotment: it comes
/// from the property's own inventory setup or a channel-driven allotment
/// change, never from a UI edit of the counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDayLoad {
    pub key: InventoryKey,
    pub allotment: u32,
    pub restrictions: Restrictions,
}

/// Authoritative allotment counter for one (hotel, room type, date).
///
/// `allotment` is the number of rooms still sellable; `reserved` counts units
/// held by reservations. Both are unsigned, so the counter cannot go negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDay {
    pub key: InventoryKey,
    pub allotment: u32,
    pub reserved: u32,
    pub restrictions: Restrictions,
    pub updated_at: DateTime<Utc>,
}

/// What a single-night release did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReleaseEffect {
    Released,
    /// Nothing was held on this night; the counter was left unchanged.
    Clamped,
}

impl InventoryDay {
    /// Lazily create a day from its first load.
    pub fn from_load(load: &InventoryDayLoad, now: DateTime<Utc>) -> Self {
        Self {
            key: load.key,
            allotment: load.allotment,
            reserved: 0,
            restrictions: load.restrictions.clone(),
            updated_at: now,
        }
    }

    /// Replace allotment and restrictions from a later load, keeping holds.
    pub fn apply_load(&mut self, load: &InventoryDayLoad, now: DateTime<Utc>) {
        self.allotment = load.allotment;
        self.restrictions = load.restrictions.clone();
        self.updated_at = now;
    }

    pub fn can_reserve(&self) -> bool {
        self.allotment >= 1
    }

    pub fn insufficient(&self) -> InsufficientInventory {
        InsufficientInventory {
            hotel_id: self.key.hotel_id,
            room_type_id: self.key.room_type_id,
            date: self.key.date,
            available: self.allotment,
        }
    }

    /// Take one unit. Callers needing all-or-nothing semantics over a stay
    /// must check every night first (see `InventoryBook`).
    pub fn take_one(&mut self, now: DateTime<Utc>) -> Result<(), InsufficientInventory> {
        if !self.can_reserve() {
            return Err(self.insufficient());
        }
        self.allotment -= 1;
        self.reserved += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Give one unit back, clamped to what was actually held.
    pub fn give_back_one(&mut self, now: DateTime<Utc>) -> ReleaseEffect {
        if self.reserved == 0 {
            return ReleaseEffect::Clamped;
        }
        self.reserved -= 1;
        self.allotment += 1;
        self.updated_at = now;
        ReleaseEffect::Released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(allotment: u32) -> InventoryDay {
        let load = InventoryDayLoad {
            key: InventoryKey::new(HotelId::new(), RoomTypeId::new(), "2024-06-01".parse().unwrap()),
            allotment,
            restrictions: Restrictions::default(),
        };
        InventoryDay::from_load(&load, Utc::now())
    }

    #[test]
    fn take_one_moves_unit_into_reserved() {
        let mut d = day(2);
        d.take_one(Utc::now()).unwrap();
        assert_eq!(d.allotment, 1);
        assert_eq!(d.reserved, 1);
    }

    #[test]
    fn take_one_at_zero_reports_date_and_availability() {
        let mut d = day(0);
        let err = d.take_one(Utc::now()).unwrap_err();
        assert_eq!(err.date, d.key.date);
        assert_eq!(err.available, 0);
        assert_eq!(d.allotment, 0);
    }

    #[test]
    fn give_back_without_hold_is_clamped() {
        let mut d = day(3);
        assert_eq!(d.give_back_one(Utc::now()), ReleaseEffect::Clamped);
        assert_eq!(d.allotment, 3);
    }

    #[test]
    fn reload_keeps_reserved_units() {
        let mut d = day(2);
        d.take_one(Utc::now()).unwrap();
        let load = InventoryDayLoad {
            key: d.key,
            allotment: 5,
            restrictions: Restrictions {
                stop_sell: true,
                ..Restrictions::default()
            },
        };
        d.apply_load(&load, Utc::now());
        assert_eq!(d.allotment, 5);
        assert_eq!(d.reserved, 1);
        assert!(d.restrictions.stop_sell);
    }
}
