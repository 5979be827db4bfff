//! Inventory ledger: the single writer of allotment counters.

pub mod in_memory;
pub mod postgres;

use chrono::NaiveDate;

use innsync_core::{DomainError, HotelId, ReservationId, RoomTypeId, StayRange};
use innsync_inventory::{
    HoldOutcome, InsufficientInventory, InventoryDay, InventoryDayLoad, ReleaseReport, StayHold,
};

pub use in_memory::InMemoryInventoryLedger;
pub use postgres::PostgresInventoryLedger;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Insufficient(#[from] InsufficientInventory),
    #[error("invalid ledger request: {0}")]
    Invalid(#[from] DomainError),
    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn as_insufficient(&self) -> Option<&InsufficientInventory> {
        match self {
            LedgerError::Insufficient(err) => Some(err),
            _ => None,
        }
    }
}

/// Authoritative per-date, per-room-type allotment.
///
/// Every operation is atomic: a multi-night reserve either takes every night
/// or none, and operations on the same (hotel, room type, date) serialize.
#[async_trait::async_trait]
pub trait InventoryLedger: Send + Sync {
    async fn reserve(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        stay: StayRange,
    ) -> Result<(), LedgerError>;

    /// Give nights back. Nights with nothing held are clamped, never an error.
    async fn release(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        stay: StayRange,
    ) -> Result<ReleaseReport, LedgerError>;

    async fn get_availability(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        date: NaiveDate,
    ) -> Result<Option<InventoryDay>, LedgerError>;

    /// Loaded days within `range`, ascending.
    async fn availability_range(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        range: StayRange,
    ) -> Result<Vec<InventoryDay>, LedgerError>;

    /// Inbound allotment load; creates the day or replaces allotment and
    /// restrictions, keeping what reservations hold.
    async fn load_day(&self, load: InventoryDayLoad) -> Result<InventoryDay, LedgerError>;

    /// Idempotently hold a reservation's stay.
    async fn hold_for(&self, hold: StayHold) -> Result<HoldOutcome, LedgerError>;

    /// Drop a reservation's hold. `None` when nothing was held.
    async fn release_hold(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<(StayHold, ReleaseReport)>, LedgerError>;

    async fn get_hold(&self, reservation_id: ReservationId) -> Result<Option<StayHold>, LedgerError>;
}
