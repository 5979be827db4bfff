use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use innsync_core::{HotelId, RoomTypeId};

/// A reserve could not be satisfied on at least one night.
///
/// Recoverable: the caller must reject the originating reservation or booking.
/// `date` is the first night (ascending) without capacity.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("insufficient inventory for room type {room_type_id} on {date} (available: {available})")]
pub struct InsufficientInventory {
    pub hotel_id: HotelId,
    pub room_type_id: RoomTypeId,
    pub date: NaiveDate,
    pub available: u32,
}
