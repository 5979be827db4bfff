//! Mapping of channel bookings onto internal reservations.
//!
//! The reservation subsystem owns reservations; the engine only needs a
//! stable internal id per external booking and the last status it saw. The id
//! is derived from the connection and external id, so a directory that lost
//! its state still maps a booking onto the hold it already has.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;

use innsync_core::{ConnectionId, HotelId, ReservationId, RoomTypeId};
use innsync_inventory::{ReservationSnapshot, ReservationStatus};

use crate::channel::ChannelBooking;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertedReservation {
    pub reservation: ReservationSnapshot,
    /// Status before this upsert; `None` for a first sighting.
    pub previous_status: Option<ReservationStatus>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("reservation directory error: {0}")]
pub struct DirectoryError(pub String);

#[async_trait::async_trait]
pub trait ReservationDirectory: Send + Sync {
    async fn upsert_channel_booking(
        &self,
        connection_id: ConnectionId,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        booking: &ChannelBooking,
    ) -> Result<UpsertedReservation, DirectoryError>;
}

#[derive(Debug, Default)]
pub struct InMemoryReservationDirectory {
    by_external: RwLock<HashMap<(ConnectionId, String), ReservationSnapshot>>,
}

impl InMemoryReservationDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ReservationDirectory for InMemoryReservationDirectory {
    async fn upsert_channel_booking(
        &self,
        connection_id: ConnectionId,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        booking: &ChannelBooking,
    ) -> Result<UpsertedReservation, DirectoryError> {
        let mut map = self.by_external.write().unwrap_or_else(PoisonError::into_inner);
        let key = (connection_id, booking.external_id.clone());
        let previous = map.get(&key).cloned();

        let reservation = ReservationSnapshot {
            id: ReservationId::for_channel_booking(connection_id, &booking.external_id),
            hotel_id,
            room_type_id,
            stay: booking.stay,
            status: booking.status,
        };
        map.insert(key, reservation.clone());

        Ok(UpsertedReservation {
            reservation,
            previous_status: previous.map(|r| r.status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use innsync_core::StayRange;

    #[tokio::test]
    async fn external_id_maps_to_stable_reservation() {
        let directory = InMemoryReservationDirectory::new();
        let (conn, hotel, room) = (ConnectionId::new(), HotelId::new(), RoomTypeId::new());
        let mut booking = ChannelBooking {
            external_id: "CM-7".into(),
            room_code: "DBL".into(),
            stay: StayRange::new("2024-06-01".parse().unwrap(), "2024-06-02".parse().unwrap()).unwrap(),
            status: ReservationStatus::Confirmed,
            guest_name: None,
            updated_at: None,
        };

        let first = directory.upsert_channel_booking(conn, hotel, room, &booking).await.unwrap();
        assert_eq!(first.previous_status, None);

        booking.status = ReservationStatus::Cancelled;
        let second = directory.upsert_channel_booking(conn, hotel, room, &booking).await.unwrap();
        assert_eq!(second.reservation.id, first.reservation.id);
        assert_eq!(second.previous_status, Some(ReservationStatus::Confirmed));

        let rebuilt = InMemoryReservationDirectory::new();
        let again = rebuilt.upsert_channel_booking(conn, hotel, room, &booking).await.unwrap();
        assert_eq!(again.reservation.id, first.reservation.id);
        assert_eq!(again.previous_status, None);
    }
}
