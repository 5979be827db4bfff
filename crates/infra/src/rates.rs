//! Nightly rates for rate pushes. The rate plan itself is owned elsewhere;
//! the engine only reads it.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use innsync_core::{HotelId, RoomTypeId, StayRange};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightlyRate {
    pub date: NaiveDate,
    /// Amount in minor currency units (cents).
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("rate source unavailable: {0}")]
pub struct RateSourceError(pub String);

#[async_trait::async_trait]
pub trait RateSource: Send + Sync {
    /// Rates for the nights of `range` that have one, ascending.
    async fn nightly_rates(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        range: StayRange,
    ) -> Result<Vec<NightlyRate>, RateSourceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRateTable {
    rates: RwLock<BTreeMap<(HotelId, RoomTypeId, NaiveDate), NightlyRate>>,
}

impl InMemoryRateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rate(&self, hotel_id: HotelId, room_type_id: RoomTypeId, rate: NightlyRate) {
        let mut rates = self.rates.write().unwrap_or_else(PoisonError::into_inner);
        rates.insert((hotel_id, room_type_id, rate.date), rate);
    }
}

#[async_trait::async_trait]
impl RateSource for InMemoryRateTable {
    async fn nightly_rates(
        &self,
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        range: StayRange,
    ) -> Result<Vec<NightlyRate>, RateSourceError> {
        let rates = self.rates.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rates
            .range((hotel_id, room_type_id, range.check_in())..(hotel_id, room_type_id, range.check_out()))
            .map(|(_, rate)| rate.clone())
            .collect())
    }
}
