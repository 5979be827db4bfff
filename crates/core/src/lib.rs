//! Shared building blocks for the channel sync engine.
//!
//! Identifiers, the stay-range value object and the domain error type. No IO.

pub mod error;
pub mod id;
pub mod value_object;

pub use error::{DomainError, DomainResult};
pub use id::{ConnectionId, HotelId, ReservationId, RoomTypeId, SyncLogId, TaskId};
pub use value_object::StayRange;
