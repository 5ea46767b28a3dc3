use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Maximum cumulative active tickets one user may hold for one event.
pub const MAX_TICKETS_PER_EVENT: i64 = 5;

/// Bucket name used for events without named ticket types.
pub const GENERAL_BUCKET: &str = "General";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub date: String,
    pub time: Option<String>,
    pub venue: String,
    pub organizer_email: Option<String>,
    /// Flat unit price, used when the event has no named ticket types.
    pub price: i64,
    /// Remaining units in the flat pool.
    pub capacity: i64,
    /// Flat pool ceiling, fixed at creation.
    pub total_capacity: i64,
}

impl Event {
    /// Scheduled start as a naive datetime. Missing time means midnight.
    /// Returns None when the stored date/time strings do not parse.
    pub fn scheduled_at(&self) -> Option<NaiveDateTime> {
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").ok()?;
        let time = match &self.time {
            Some(t) => NaiveTime::parse_from_str(t, "%H:%M").ok()?,
            None => NaiveTime::MIN,
        };
        Some(date.and_time(time))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketType {
    pub id: i64,
    pub event_id: i64,
    pub name: String,
    pub unit_price: i64,
    pub total_units: i64,
    pub available_units: i64,
}

/// An event's countable ticket supply: either named ticket-type buckets or a
/// single flat capacity pool.
#[derive(Debug, Clone, Serialize)]
pub enum Inventory {
    Named(Vec<TicketType>),
    Flat { unit_price: i64, available: i64, total: i64 },
}

/// A normalized bucket, whichever inventory shape it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub name: String,
    pub unit_price: i64,
    pub available: i64,
    pub total: i64,
    /// True when synthesized from a flat capacity pool.
    pub implicit: bool,
}

impl Inventory {
    /// Resolve a requested bucket name. Named buckets match exactly
    /// (case-sensitive). A flat pool resolves any request to the implicit
    /// "General" bucket.
    pub fn find_bucket(&self, requested: Option<&str>) -> Option<Bucket> {
        match self {
            Inventory::Named(types) => {
                let name = requested?;
                types.iter().find(|t| t.name == name).map(|t| Bucket {
                    name: t.name.clone(),
                    unit_price: t.unit_price,
                    available: t.available_units,
                    total: t.total_units,
                    implicit: false,
                })
            }
            Inventory::Flat { unit_price, available, total } => Some(Bucket {
                name: GENERAL_BUCKET.to_string(),
                unit_price: *unit_price,
                available: *available,
                total: *total,
                implicit: true,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

/// Contact snapshot captured at booking time, independent of later profile
/// edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContact {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: i64,
    pub user_id: i64,
    pub event_id: i64,
    pub ticket_type: String,
    pub quantity: i64,
    pub unit_price: i64,
    pub total_price: i64,
    pub status: BookingStatus,
    pub seat_numbers: Vec<String>,
    pub contact: UserContact,
    pub booked_at: String,
}

/// Per-user per-event booking summary.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub total_booked: i64,
    pub can_book_more: bool,
    pub remaining_slots: i64,
}

// --- Creation payloads ---

#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    pub title: String,
    pub date: String,
    pub time: Option<String>,
    #[serde(default)]
    pub venue: String,
    pub organizer_email: Option<String>,
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub capacity: i64,
    #[serde(default)]
    pub ticket_types: Vec<NewTicketType>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTicketType {
    pub name: String,
    pub unit_price: i64,
    pub total_units: i64,
}

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub user_id: i64,
    pub event_id: i64,
    pub ticket_type: String,
    pub quantity: i64,
    pub unit_price: i64,
    pub total_price: i64,
    pub seat_numbers: Vec<String>,
    pub contact: UserContact,
}
