//! Per-channel request shaping and response parsing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use innsync_core::{ConnectionId, RoomTypeId, StayRange};
use innsync_inventory::{ReservationStatus, Restrictions};

use super::transport::{ChannelRequest, ChannelResponse, TransportError};
use crate::queue::TaskKind;
use crate::rates::NightlyRate;

/// Booking pull filter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullMode {
    New,
    Arrivals,
    Departures,
    CurrentlyStaying,
}

impl PullMode {
    pub const ALL: [PullMode; 4] = [
        PullMode::New,
        PullMode::Arrivals,
        PullMode::Departures,
        PullMode::CurrentlyStaying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PullMode::New => "new",
            PullMode::Arrivals => "arrivals",
            PullMode::Departures => "departures",
            PullMode::CurrentlyStaying => "currently_staying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        PullMode::ALL.into_iter().find(|m| m.as_str() == s)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    /// Aggregator JSON API.
    ChannelManager,
    /// OTA-style JSON API.
    Ota,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::ChannelManager => "channel_manager",
            ChannelType::Ota => "ota",
        }
    }
}

/// A booking as reported by a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBooking {
    pub external_id: String,
    pub room_code: String,
    pub stay: StayRange,
    pub status: ReservationStatus,
    pub guest_name: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A booking record in a pulled page that could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedBooking {
    pub external_id: Option<String>,
    pub reason: String,
}

impl RejectedBooking {
    pub fn new(external_id: Option<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            external_id,
            reason: reason.to_string(),
        }
    }
}

/// One pulled page. Records are read independently, so a bad record only
/// rejects itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPage {
    pub bookings: Vec<ChannelBooking>,
    pub rejected: Vec<RejectedBooking>,
}

impl FromIterator<Result<ChannelBooking, RejectedBooking>> for BookingPage {
    fn from_iter<I: IntoIterator<Item = Result<ChannelBooking, RejectedBooking>>>(iter: I) -> Self {
        let mut page = BookingPage::default();
        for parsed in iter {
            match parsed {
                Ok(booking) => page.bookings.push(booking),
                Err(rejected) => page.rejected.push(rejected),
            }
        }
        page
    }
}

/// String field `key` of a raw record, for naming a record that failed to
/// deserialize.
pub(crate) fn record_id(record: &serde_json::Value, key: &str) -> Option<String> {
    record.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// One night of outbound data. Fields a task kind does not carry are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySnapshot {
    pub date: NaiveDate,
    pub availability: Option<u32>,
    pub restrictions: Option<Restrictions>,
    pub rate: Option<NightlyRate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub room_type_id: RoomTypeId,
    pub room_code: String,
    pub days: Vec<DaySnapshot>,
}

/// Everything a push task sends, resolved from the ledger and rate source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushSnapshot {
    pub connection_id: ConnectionId,
    pub property_code: String,
    pub kind: TaskKind,
    pub range: StayRange,
    pub rooms: Vec<RoomSnapshot>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// The channel answered but refused the update.
    #[error("channel rejected update: {0}")]
    Rejected(String),
    #[error("unexpected channel payload: {0}")]
    Malformed(String),
    #[error("no adapter registered for channel type {0}")]
    Unsupported(String),
}

impl From<TransportError> for AdapterError {
    fn from(err: TransportError) -> Self {
        AdapterError::Malformed(err.to_string())
    }
}

/// Shapes requests for, and reads responses from, one channel type.
pub trait ChannelAdapter: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    fn push_request(&self, snapshot: &PushSnapshot) -> Result<ChannelRequest, AdapterError>;

    /// Check the channel acknowledged the push.
    fn verify_push(&self, response: &ChannelResponse) -> Result<(), AdapterError>;

    fn pull_request(&self, property_code: &str, mode: PullMode) -> ChannelRequest;

    /// Read a booking page. Only an unreadable page as a whole is an error.
    fn parse_bookings(&self, response: &ChannelResponse) -> Result<BookingPage, AdapterError>;
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ChannelType, Arc<dyn ChannelAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("channel_types", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every shipped adapter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::adapters::ChannelManagerAdapter));
        registry.register(Arc::new(super::adapters::OtaAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.channel_type(), adapter);
    }

    pub fn get(&self, channel_type: ChannelType) -> Result<Arc<dyn ChannelAdapter>, AdapterError> {
        self.adapters
            .get(&channel_type)
            .cloned()
            .ok_or_else(|| AdapterError::Unsupported(channel_type.as_str().to_string()))
    }
}
