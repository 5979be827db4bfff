//! OTA-style JSON API: camelCase fields, updates grouped per room.

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
pub struct OtaAdapter;

#[derive(Debug, Deserialize)]
struct Ack {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReservationList {
    reservations: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReservationRecord {
    reservation_id: String,
    room_id: String,
    check_in: NaiveDate,
    check_out: NaiveDate,
    state: String,
    #[serde(default)]
    guest_name: Option<String>,
    #[serde(default)]
    last_modified: Option<DateTime<Utc>>,
}

fn status_from_state(state: &str) -> Result<ReservationStatus, String> {
    match state {
        "BOOKED" | "MODIFIED" => Ok(ReservationStatus::Confirmed),
        "CANCELLED" => Ok(ReservationStatus::Cancelled),
        "CHECKED_IN" => Ok(ReservationStatus::CheckedIn),
        "CHECKED_OUT" => Ok(ReservationStatus::CheckedOut),
        "NO_SHOW" => Ok(ReservationStatus::NoShow),
        "PENDING" | "ON_REQUEST" => Ok(ReservationStatus::Pending),
        other => Err(format!("unknown reservation state {other}")),
    }
}

impl ChannelAdapter for OtaAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Ota
    }

    fn push_request(&self, snapshot: &PushSnapshot) -> Result<ChannelRequest, AdapterError> {
        let rooms: Vec<Value> = snapshot
            .rooms
            .iter()
            .map(|room| {
                let days: Vec<Value> = room
                    .days
                    .iter()
                    .map(|day| {
                        let mut entry = Map::new();
                        entry.insert("date".into(), json!(day.date));
                        if let Some(allotment) = day.availability {
                            entry.insert("allotment".into(), json!(allotment));
                        }
                        if let Some(r) = &day.restrictions {
                            entry.insert("closed".into(), json!(r.stop_sell));
                            entry.insert("minLos".into(), json!(r.min_stay));
                            if let Some(max) = r.max_stay {
                                entry.insert("maxLos".into(), json!(max));
                            }
                            entry.insert("cta".into(), json!(r.closed_to_arrival));
                            entry.insert("ctd".into(), json!(r.closed_to_departure));
                        }
                        if let Some(rate) = &day.rate {
                            entry.insert(
                                "price".into(),
                                json!({ "amount": rate.amount_minor, "currency": rate.currency }),
                            );
                        }
                        Value::Object(entry)
                    })
                    .collect();
                json!({ "roomId": room.room_code, "days": days })
            })
            .collect();

        Ok(ChannelRequest::post(
            format!("hotels/{}/inventory", snapshot.property_code),
            json!({ "rooms": rooms }),
        ))
    }

    fn verify_push(&self, response: &ChannelResponse) -> Result<(), AdapterError> {
        let ack: Ack = serde_json::from_value(response.json()?)
            .map_err(|e| AdapterError::Malformed(format!("ack: {e}")))?;
        match ack.status.as_str() {
            "OK" => Ok(()),
            _ => Err(AdapterError::Rejected(
                ack.message.unwrap_or_else(|| format!("status {}", ack.status)),
            )),
        }
    }

    fn pull_request(&self, property_code: &str, mode: PullMode) -> ChannelRequest {
        let kind = match mode {
            PullMode::New => "NEW",
            PullMode::Arrivals => "ARRIVALS",
            PullMode::Departures => "DEPARTURES",
            PullMode::CurrentlyStaying => "STAYING",
        };
        ChannelRequest::get(format!("hotels/{property_code}/reservations")).with_query("type", kind)
    }

    fn parse_bookings(&self, response: &ChannelResponse) -> Result<BookingPage, AdapterError> {
        let list: ReservationList = serde_json::from_value(response.json()?)
            .map_err(|e| AdapterError::Malformed(format!("reservations: {e}")))?;
        Ok(list.reservations.into_iter().map(booking_from_record).collect())
    }
}

fn booking_from_record(record: Value) -> Result<ChannelBooking, RejectedBooking> {
    let id = record_id(&record, "reservationId");
    let r: ReservationRecord =
        serde_json::from_value(record).map_err(|e| RejectedBooking::new(id.clone(), e))?;
    let stay = StayRange::new(r.check_in, r.check_out).map_err(|e| RejectedBooking::new(id.clone(), e))?;
    let status = status_from_state(&r.state).map_err(|e| RejectedBooking::new(id, e))?;
    Ok(ChannelBooking {
        status,
        external_id: r.reservation_id,
        room_code: r.room_id,
        stay,
        guest_name: r.guest_name,
        updated_at: r.last_modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::adapter::{DaySnapshot, RoomSnapshot};
    use crate::queue::TaskKind;
    use crate::rates::NightlyRate;
    use innsync_core::{ConnectionId, RoomTypeId};
    use reqwest::header::HeaderMap;

    fn response(body: &str) -> ChannelResponse {
        ChannelResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: body.to_string(),
        }
    }

    #[test]
    fn groups_days_per_room() {
        let date: NaiveDate = "2024-06-01".parse().unwrap();
        let snapshot = PushSnapshot {
            connection_id: ConnectionId::new(),
            property_code: "9001".into(),
            kind: TaskKind::Rate,
            range: StayRange::single_night(date).unwrap(),
            rooms: vec![RoomSnapshot {
                room_type_id: RoomTypeId::new(),
                room_code: "STD".into(),
                days: vec![DaySnapshot {
                    date,
                    availability: None,
                    restrictions: None,
                    rate: Some(NightlyRate {
                        date,
                        amount_minor: 12_500,
                        currency: "EUR".into(),
                    }),
                }],
            }],
        };

        let request = OtaAdapter.push_request(&snapshot).unwrap();
        let body = request.body.unwrap();
        assert_eq!(body["rooms"][0]["roomId"], "STD");
        assert_eq!(body["rooms"][0]["days"][0]["price"]["amount"], 12_500);
        assert!(body["rooms"][0]["days"][0].get("allotment").is_none());
    }

    #[test]
    fn maps_reservation_states() {
        let page = OtaAdapter
            .parse_bookings(&response(
                r#"{"reservations":[
                    {"reservationId":"R1","roomId":"STD","checkIn":"2024-06-01","checkOut":"2024-06-02","state":"BOOKED"},
                    {"reservationId":"R2","roomId":"STD","checkIn":"2024-06-01","checkOut":"2024-06-02","state":"CANCELLED"},
                    {"reservationId":"R3","roomId":"STD","checkIn":"2024-06-01","checkOut":"2024-06-02","state":"ARCHIVED"}
                ]}"#,
            ))
            .unwrap();
        assert_eq!(page.bookings.len(), 2);
        assert_eq!(page.bookings[0].status, ReservationStatus::Confirmed);
        assert_eq!(page.bookings[1].status, ReservationStatus::Cancelled);
        assert_eq!(page.rejected.len(), 1);
        assert_eq!(page.rejected[0].external_id.as_deref(), Some("R3"));
        assert!(page.rejected[0].reason.contains("ARCHIVED"));
    }

    #[test]
    fn non_ok_ack_is_rejected() {
        let err = OtaAdapter
            .verify_push(&response(r#"{"status":"ERROR","message":"rate below floor"}"#))
            .unwrap_err();
        assert!(matches!(err, AdapterError::Rejected(msg) if msg == "rate below floor"));
    }
}
