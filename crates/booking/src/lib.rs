//! Booking transaction coordinator: validates a booking request against the
//! event's ticket inventory and the user's ledger, reserves units through
//! atomic conditional updates, appends the ledger entry, and reverses the
//! reservation on cancellation.

use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use compass_models::{
    Booking, BookingStatus, Event, Inventory, MAX_TICKETS_PER_EVENT, NewBooking, StatusSummary,
    UserContact,
};
use compass_notify::Mailer;
use rand::Rng;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

pub type Result<T> = std::result::Result<T, BookingError>;

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("you can only book between 1 and 5 tickets")]
    InvalidQuantity,

    #[error("event not found")]
    EventNotFound,

    #[error("cannot book tickets for past events")]
    EventExpired,

    #[error("invalid ticket type")]
    InvalidBucket,

    #[error(
        "you can only book a maximum of 5 tickets per event; \
         you have already booked {booked} ticket(s), {remaining} more allowed"
    )]
    BookingCapExceeded { booked: i64, remaining: i64 },

    #[error("only {available} ticket(s) available for {bucket}")]
    InsufficientInventory { bucket: String, available: i64 },

    #[error("booking not found")]
    NotFound,

    #[error("booking belongs to another user")]
    Forbidden,

    #[error("booking already cancelled")]
    AlreadyCancelled,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub user_id: i64,
    pub event_id: i64,
    pub ticket_type: Option<String>,
    pub quantity: i64,
    pub contact: UserContact,
}

/// Create a booking against the current clock and hand the confirmation to
/// the mailer as a detached task.
pub async fn create_booking(
    pool: &SqlitePool,
    mailer: &Arc<Mailer>,
    req: BookingRequest,
) -> Result<Booking> {
    let (booking, event) = create_booking_at(pool, req, Utc::now().naive_utc()).await?;
    compass_notify::spawn_confirmation(mailer.clone(), booking.clone(), event);
    Ok(booking)
}

/// Booking transaction proper, with the clock injected. Steps and rejection
/// order follow the contract: quantity, event lookup, expiry, bucket, cap,
/// reserve, ledger append. Inventory decrement and ledger insert either both
/// land or the decrement is compensated.
pub async fn create_booking_at(
    pool: &SqlitePool,
    req: BookingRequest,
    now: NaiveDateTime,
) -> Result<(Booking, Event)> {
    if !(1..=MAX_TICKETS_PER_EVENT).contains(&req.quantity) {
        return Err(BookingError::InvalidQuantity);
    }

    let event = compass_db::get_event(pool, req.event_id)
        .await?
        .ok_or(BookingError::EventNotFound)?;

    // An unparseable schedule cannot be compared; let the booking through
    // rather than lock the event on bad listing data.
    if let Some(at) = event.scheduled_at() {
        if at < now {
            return Err(BookingError::EventExpired);
        }
    }

    let inventory = compass_db::load_inventory(pool, &event).await?;
    let bucket = inventory
        .find_bucket(req.ticket_type.as_deref())
        .ok_or(BookingError::InvalidBucket)?;

    let booked = compass_db::active_quantity(pool, req.user_id, req.event_id).await?;
    if booked + req.quantity > MAX_TICKETS_PER_EVENT {
        return Err(BookingError::BookingCapExceeded {
            booked,
            remaining: (MAX_TICKETS_PER_EVENT - booked).max(0),
        });
    }

    let reserved = if bucket.implicit {
        compass_db::reserve_capacity(pool, event.id, req.quantity).await?
    } else {
        compass_db::reserve_ticket_type(pool, event.id, &bucket.name, req.quantity).await?
    };
    if !reserved {
        return Err(insufficient(pool, &event, &bucket.name).await?);
    }

    let new = NewBooking {
        user_id: req.user_id,
        event_id: req.event_id,
        ticket_type: bucket.name.clone(),
        quantity: req.quantity,
        unit_price: bucket.unit_price,
        total_price: bucket.unit_price * req.quantity,
        seat_numbers: seat_labels(&bucket.name, req.quantity),
        contact: req.contact,
    };

    // The insert re-checks the cap atomically; if it refuses (a racer got in
    // between) or errors, the reservation above must be handed back.
    let inserted = match compass_db::insert_booking_capped(pool, &new).await {
        Ok(inserted) => inserted,
        Err(e) => {
            release(pool, &event, &bucket.name, bucket.implicit, req.quantity).await?;
            return Err(e.into());
        }
    };
    let Some(booking) = inserted else {
        release(pool, &event, &bucket.name, bucket.implicit, req.quantity).await?;
        let booked = compass_db::active_quantity(pool, req.user_id, req.event_id).await?;
        return Err(BookingError::BookingCapExceeded {
            booked,
            remaining: (MAX_TICKETS_PER_EVENT - booked).max(0),
        });
    };

    info!(
        "Booking {} confirmed: user {} x{} {} for event {} ({})",
        booking.id, booking.user_id, booking.quantity, booking.ticket_type, event.id, event.title
    );
    Ok((booking, event))
}

/// Cancel a booking on behalf of its owner and restore the reserved units.
pub async fn cancel_booking(pool: &SqlitePool, booking_id: i64, user_id: i64) -> Result<Booking> {
    let booking = compass_db::get_booking(pool, booking_id)
        .await?
        .ok_or(BookingError::NotFound)?;
    if booking.user_id != user_id {
        return Err(BookingError::Forbidden);
    }
    if booking.status == BookingStatus::Cancelled {
        return Err(BookingError::AlreadyCancelled);
    }

    // Flip first: the status guard means a racing double-cancel loses here
    // and never reaches the release below.
    if !compass_db::mark_cancelled(pool, booking_id).await? {
        return Err(BookingError::AlreadyCancelled);
    }

    // The event may have been edited (or its buckets renamed) since the
    // booking was made; a vanished event or bucket is skipped silently, the
    // ledger cancellation stands either way.
    if let Some(event) = compass_db::get_event(pool, booking.event_id).await? {
        match compass_db::load_inventory(pool, &event).await? {
            Inventory::Named(_) => {
                compass_db::release_ticket_type(
                    pool,
                    event.id,
                    &booking.ticket_type,
                    booking.quantity,
                )
                .await?;
            }
            Inventory::Flat { .. } => {
                compass_db::release_capacity(pool, event.id, booking.quantity).await?;
            }
        }
    }

    info!("Booking {} cancelled by user {}", booking_id, user_id);
    compass_db::get_booking(pool, booking_id)
        .await?
        .ok_or(BookingError::NotFound)
}

/// How many tickets the user holds for the event and how many more the cap
/// allows.
pub async fn check_user_status(
    pool: &SqlitePool,
    user_id: i64,
    event_id: i64,
) -> Result<StatusSummary> {
    let total_booked = compass_db::active_quantity(pool, user_id, event_id).await?;
    Ok(StatusSummary {
        total_booked,
        can_book_more: total_booked < MAX_TICKETS_PER_EVENT,
        remaining_slots: (MAX_TICKETS_PER_EVENT - total_booked).max(0),
    })
}

/// The user's active bookings, newest first.
pub async fn list_user_bookings(pool: &SqlitePool, user_id: i64) -> Result<Vec<Booking>> {
    Ok(compass_db::list_active_bookings(pool, user_id).await?)
}

// --- Internals ---

/// Re-read the live availability for the rejection message.
async fn insufficient(
    pool: &SqlitePool,
    event: &Event,
    bucket_name: &str,
) -> std::result::Result<BookingError, anyhow::Error> {
    let event = compass_db::get_event(pool, event.id).await?.unwrap_or_else(|| event.clone());
    let inventory = compass_db::load_inventory(pool, &event).await?;
    let available = inventory
        .find_bucket(Some(bucket_name))
        .map(|b| b.available)
        .unwrap_or(0);
    Ok(BookingError::InsufficientInventory {
        bucket: bucket_name.to_string(),
        available,
    })
}

async fn release(
    pool: &SqlitePool,
    event: &Event,
    bucket_name: &str,
    implicit: bool,
    quantity: i64,
) -> std::result::Result<(), anyhow::Error> {
    if implicit {
        compass_db::release_capacity(pool, event.id, quantity).await
    } else {
        compass_db::release_ticket_type(pool, event.id, bucket_name, quantity).await
    }
}

/// Seat labels: uppercased bucket initial plus a random 3-digit base and a
/// running index. Display convenience only, no uniqueness across bookings.
fn seat_labels(bucket_name: &str, quantity: i64) -> Vec<String> {
    let prefix = bucket_name
        .chars()
        .next()
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or('G');
    let base: i64 = rand::thread_rng().gen_range(100..=999);
    (0..quantity).map(|i| format!("{prefix}{}", base + i)).collect()
}
