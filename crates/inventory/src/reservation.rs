//! Reservation status rules (the reservation entity itself lives elsewhere).

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use innsync_core::{DomainError, HotelId, ReservationId, RoomTypeId, StayRange};

/// Reservation status as reported by the reservation subsystem or a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    CheckedIn,
    CheckedOut,
    NoShow,
}

/// What a status means for the inventory ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LedgerEffect {
    /// The stay must be held (idempotent per reservation).
    Hold,
    /// Any hold for the reservation must be given back.
    Release,
    /// Leave the ledger alone.
    None,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::CheckedIn => "checked_in",
            ReservationStatus::CheckedOut => "checked_out",
            ReservationStatus::NoShow => "no_show",
        }
    }

    /// Ledger effect of arriving in this status.
    ///
    /// A checked-in guest still occupies the room, so it holds like a
    /// confirmation (a no-op when the confirmation already held). Checked-out
    /// and no-show stays keep whatever was held; the night is in the past.
    pub fn ledger_effect(&self) -> LedgerEffect {
        match self {
            ReservationStatus::Confirmed | ReservationStatus::CheckedIn => LedgerEffect::Hold,
            ReservationStatus::Cancelled => LedgerEffect::Release,
            ReservationStatus::Pending
            | ReservationStatus::CheckedOut
            | ReservationStatus::NoShow => LedgerEffect::None,
        }
    }
}

impl core::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = DomainError;

    /// Accepts snake_case and kebab-case spellings, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "pending" => Ok(ReservationStatus::Pending),
            "confirmed" | "new" | "modified" => Ok(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Ok(ReservationStatus::Cancelled),
            "checked_in" | "in_house" => Ok(ReservationStatus::CheckedIn),
            "checked_out" => Ok(ReservationStatus::CheckedOut),
            "no_show" => Ok(ReservationStatus::NoShow),
            other => Err(DomainError::validation(format!(
                "unknown reservation status: {other}"
            ))),
        }
    }
}

/// The fields of a reservation the ledger needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSnapshot {
    pub id: ReservationId,
    pub hotel_id: HotelId,
    pub room_type_id: RoomTypeId,
    pub stay: StayRange,
    pub status: ReservationStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_spellings() {
        assert_eq!("Checked-In".parse::<ReservationStatus>().unwrap(), ReservationStatus::CheckedIn);
        assert_eq!("canceled".parse::<ReservationStatus>().unwrap(), ReservationStatus::Cancelled);
        assert_eq!("modified".parse::<ReservationStatus>().unwrap(), ReservationStatus::Confirmed);
        assert!("archived".parse::<ReservationStatus>().is_err());
    }

    #[test]
    fn effects_follow_lifecycle() {
        assert_eq!(ReservationStatus::Confirmed.ledger_effect(), LedgerEffect::Hold);
        assert_eq!(ReservationStatus::Cancelled.ledger_effect(), LedgerEffect::Release);
        assert_eq!(ReservationStatus::Pending.ledger_effect(), LedgerEffect::None);
        assert_eq!(ReservationStatus::NoShow.ledger_effect(), LedgerEffect::None);
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&ReservationStatus::NoShow).unwrap();
        assert_eq!(json, "\"no_show\"");
    }
}
