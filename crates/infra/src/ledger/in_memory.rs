use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{NaiveDate, Utc};

use innsync_core::{HotelId, ReservationId, RoomTypeId, StayRange};
use innsync_inventory::{
    HoldOutcome, InventoryBook, InventoryDay, InventoryDayLoad, InventoryKey, ReleaseReport,
    StayHold,
};

use super::{InventoryLedger, LedgerError};

/// Ledger over an `InventoryBook` behind one mutex.
///
/// Check-and-apply happens under the same lock, so concurrent reserves on the
/// same night cannot both see the last unit.
#[derive(Debug, Default)]
pub struct InMemoryInventoryLedger {
    book: Mutex<InventoryBook>,
}

impl InMemoryInventoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn book(&self) -> MutexGuard<'_, InventoryBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl InventoryLedger for InMemoryInventoryLedger {
    async fn reserve(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        stay: StayRange,
    ) -> Result<(), LedgerError> {
        self.book()
            .reserve(hotel_id, room_type_id, &stay, Utc::now())
            .map_err(LedgerError::from)
    }

    async fn release(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        stay: StayRange,
    ) -> Result<ReleaseReport, LedgerError> {
        Ok(self.book().release(hotel_id, room_type_id, &stay, Utc::now()))
    }

    async fn get_availability(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        date: NaiveDate,
    ) -> Result<Option<InventoryDay>, LedgerError> {
        Ok(self
            .book()
            .day(&InventoryKey::new(hotel_id, room_type_id, date))
            .cloned())
    }

    async fn availability_range(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        range: StayRange,
    ) -> Result<Vec<InventoryDay>, LedgerError> {
        Ok(self.book().range(hotel_id, room_type_id, &range))
    }

    async fn load_day(&self, load: InventoryDayLoad) -> Result<InventoryDay, LedgerError> {
        Ok(self.book().load(&load, Utc::now()))
    }

    async fn hold_for(&self, hold: StayHold) -> Result<HoldOutcome, LedgerError> {
        self.book()
            .hold_for(hold, Utc::now())
            .map_err(LedgerError::from)
    }

    async fn release_hold(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<(StayHold, ReleaseReport)>, LedgerError> {
        Ok(self.book().release_hold(&reservation_id, Utc::now()))
    }

    async fn get_hold(&self, reservation_id: ReservationId) -> Result<Option<StayHold>, LedgerError> {
        Ok(self.book().hold(&reservation_id).cloned())
    }
}
