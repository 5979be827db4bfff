//! Aggregator ("channel manager") JSON API.
//!
//! Push: `POST /v1/properties/{code}/ari` with a flat list of per-night
//! updates. Pull: `GET /v1/properties/{code}/bookings?filter=...`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use innsync_core::StayRange;
use innsync_inventory::ReservationStatus;

use crate::channel::adapter::{
    AdapterError, BookingPage, ChannelAdapter, ChannelBooking, ChannelType, PullMode, PushSnapshot,
    RejectedBooking, record_id,
};
use crate::channel::transport::{ChannelRequest, ChannelResponse};

#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelManagerAdapter;

#[derive(Debug, Deserialize)]
struct Ack {
    success: bool,
    #[serde(default)]
    errors: Vec<AckError>,
}

#[derive(Debug, Deserialize)]
struct AckError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct BookingList {
    bookings: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct BookingRecord {
    id: String,
    room_code: String,
    arrival: NaiveDate,
    departure: NaiveDate,
    status: String,
    #[serde(default)]
    guest: Option<Guest>,
    #[serde(default)]
    modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Guest {
    name: Option<String>,
}

impl ChannelAdapter for ChannelManagerAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::ChannelManager
    }

    fn push_request(&self, snapshot: &PushSnapshot) -> Result<ChannelRequest, AdapterError> {
        let mut updates = Vec::new();
        for room in &snapshot.rooms {
            for day in &room.days {
                let mut update = Map::new();
                update.insert("room_code".into(), json!(room.room_code));
                update.insert("date".into(), json!(day.date));
                if let Some(availability) = day.availability {
                    update.insert("availability".into(), json!(availability));
                }
                if let Some(r) = &day.restrictions {
                    update.insert("min_stay".into(), json!(r.min_stay));
                    update.insert("max_stay".into(), json!(r.max_stay));
                    update.insert("closed_to_arrival".into(), json!(r.closed_to_arrival));
                    update.insert("closed_to_departure".into(), json!(r.closed_to_departure));
                    update.insert("stop_sell".into(), json!(r.stop_sell));
                }
                if let Some(rate) = &day.rate {
                    update.insert("rate_minor".into(), json!(rate.amount_minor));
                    update.insert("currency".into(), json!(rate.currency));
                }
                updates.push(Value::Object(update));
            }
        }

        Ok(ChannelRequest::post(
            format!("v1/properties/{}/ari", snapshot.property_code),
            json!({ "updates": updates }),
        ))
    }

    fn verify_push(&self, response: &ChannelResponse) -> Result<(), AdapterError> {
        let ack: Ack = serde_json::from_value(response.json()?)
            .map_err(|e| AdapterError::Malformed(format!("ack: {e}")))?;
        if ack.success {
            return Ok(());
        }
        let reasons: Vec<String> = ack.errors.into_iter().map(|e| e.message).collect();
        Err(AdapterError::Rejected(if reasons.is_empty() {
            "success=false".to_string()
        } else {
            reasons.join("; ")
        }))
    }

    fn pull_request(&self, property_code: &str, mode: PullMode) -> ChannelRequest {
        let filter = match mode {
            PullMode::New => "new",
            PullMode::Arrivals => "arrivals",
            PullMode::Departures => "departures",
            PullMode::CurrentlyStaying => "in_house",
        };
        ChannelRequest::get(format!("v1/properties/{property_code}/bookings")).with_query("filter", filter)
    }

    fn parse_bookings(&self, response: &ChannelResponse) -> Result<BookingPage, AdapterError> {
        let list: BookingList = serde_json::from_value(response.json()?)
            .map_err(|e| AdapterError::Malformed(format!("bookings: {e}")))?;
        Ok(list.bookings.into_iter().map(booking_from_record).collect())
    }
}

fn booking_from_record(record: Value) -> Result<ChannelBooking, RejectedBooking> {
    let id = record_id(&record, "id");
    let b: BookingRecord =
        serde_json::from_value(record).map_err(|e| RejectedBooking::new(id.clone(), e))?;
    let stay = StayRange::new(b.arrival, b.departure).map_err(|e| RejectedBooking::new(id.clone(), e))?;
    let status: ReservationStatus = b.status.parse().map_err(|e| RejectedBooking::new(id, e))?;
    Ok(ChannelBooking {
        external_id: b.id,
        room_code: b.room_code,
        stay,
        status,
        guest_name: b.guest.and_then(|g| g.name),
        updated_at: b.modified_at,
    })
}
