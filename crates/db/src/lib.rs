use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use compass_models::{
    Booking, BookingStatus, Event, Inventory, MAX_TICKETS_PER_EVENT, NewBooking, NewEvent,
    TicketType, UserContact,
};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use tracing::info;

pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePool::connect_with(options).await?;
    info!("Connected to database: {database_url}");
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("Migrations applied");
    Ok(())
}

const EVENT_COLUMNS: &str =
    "id, title, date, time, venue, organizer_email, price, capacity, total_capacity";

const TICKET_TYPE_COLUMNS: &str = "id, event_id, name, unit_price, total_units, available_units";

// --- Events ---

pub async fn create_event(pool: &SqlitePool, event: &NewEvent) -> Result<Event> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        "INSERT INTO events (title, date, time, venue, organizer_email, price, capacity, total_capacity) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.title)
    .bind(&event.date)
    .bind(&event.time)
    .bind(&event.venue)
    .bind(&event.organizer_email)
    .bind(event.price)
    .bind(event.capacity)
    .bind(event.capacity)
    .execute(&mut *tx)
    .await?;
    let event_id = result.last_insert_rowid();

    for tt in &event.ticket_types {
        sqlx::query(
            "INSERT INTO ticket_types (event_id, name, unit_price, total_units, available_units) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event_id)
        .bind(&tt.name)
        .bind(tt.unit_price)
        .bind(tt.total_units)
        .bind(tt.total_units)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    get_event(pool, event_id)
        .await?
        .ok_or_else(|| anyhow!("event {event_id} vanished after insert"))
}

pub async fn get_event(pool: &SqlitePool, event_id: i64) -> Result<Option<Event>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?");
    let event = sqlx::query_as::<_, Event>(&sql)
        .bind(event_id)
        .fetch_optional(pool)
        .await?;
    Ok(event)
}

pub async fn list_events(pool: &SqlitePool) -> Result<Vec<Event>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY date, time");
    let events = sqlx::query_as::<_, Event>(&sql).fetch_all(pool).await?;
    Ok(events)
}

pub async fn ticket_types_for_event(pool: &SqlitePool, event_id: i64) -> Result<Vec<TicketType>> {
    let sql = format!("SELECT {TICKET_TYPE_COLUMNS} FROM ticket_types WHERE event_id = ? ORDER BY id");
    let types = sqlx::query_as::<_, TicketType>(&sql)
        .bind(event_id)
        .fetch_all(pool)
        .await?;
    Ok(types)
}

/// Load an event's inventory in its normalized shape: named buckets when
/// ticket_types rows exist, the flat capacity pool otherwise.
pub async fn load_inventory(pool: &SqlitePool, event: &Event) -> Result<Inventory> {
    let types = ticket_types_for_event(pool, event.id).await?;
    if types.is_empty() {
        Ok(Inventory::Flat {
            unit_price: event.price,
            available: event.capacity,
            total: event.total_capacity,
        })
    } else {
        Ok(Inventory::Named(types))
    }
}

// --- Inventory reserve / release ---
//
// Every mutation is a single conditional UPDATE so concurrent requests
// resolve inside the database, never as read-then-write in process memory.

/// Decrement a named bucket if enough units remain. Returns false when the
/// guard fails (insufficient availability or no such bucket).
pub async fn reserve_ticket_type(
    pool: &SqlitePool,
    event_id: i64,
    name: &str,
    quantity: i64,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE ticket_types SET available_units = available_units - ? \
         WHERE event_id = ? AND name = ? AND available_units >= ?",
    )
    .bind(quantity)
    .bind(event_id)
    .bind(name)
    .bind(quantity)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Restore units to a named bucket, clamped at total_units so a duplicate
/// release can never overfill. A missing bucket is a no-op.
pub async fn release_ticket_type(
    pool: &SqlitePool,
    event_id: i64,
    name: &str,
    quantity: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE ticket_types SET available_units = min(total_units, available_units + ?) \
         WHERE event_id = ? AND name = ?",
    )
    .bind(quantity)
    .bind(event_id)
    .bind(name)
    .execute(pool)
    .await?;
    Ok(())
}

/// Decrement a flat event's capacity pool if enough units remain.
pub async fn reserve_capacity(pool: &SqlitePool, event_id: i64, quantity: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE events SET capacity = capacity - ?, updated_at = datetime('now') \
         WHERE id = ? AND capacity >= ?",
    )
    .bind(quantity)
    .bind(event_id)
    .bind(quantity)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Restore units to a flat event's pool, clamped at total_capacity.
pub async fn release_capacity(pool: &SqlitePool, event_id: i64, quantity: i64) -> Result<()> {
    sqlx::query(
        "UPDATE events SET capacity = min(total_capacity, capacity + ?), updated_at = datetime('now') \
         WHERE id = ?",
    )
    .bind(quantity)
    .bind(event_id)
    .execute(pool)
    .await?;
    Ok(())
}

// --- Booking ledger ---

const BOOKING_COLUMNS: &str = "id, user_id, event_id, ticket_type, quantity, unit_price, \
    total_price, status, seat_numbers, contact_name, contact_email, contact_phone, booked_at";

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: i64,
    user_id: i64,
    event_id: i64,
    ticket_type: String,
    quantity: i64,
    unit_price: i64,
    total_price: i64,
    status: String,
    seat_numbers: String,
    contact_name: String,
    contact_email: String,
    contact_phone: Option<String>,
    booked_at: String,
}

impl TryFrom<BookingRow> for Booking {
    type Error = anyhow::Error;

    fn try_from(row: BookingRow) -> Result<Self> {
        let status = BookingStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("booking {} has unknown status {:?}", row.id, row.status))?;
        let seat_numbers: Vec<String> = serde_json::from_str(&row.seat_numbers)?;
        Ok(Booking {
            id: row.id,
            user_id: row.user_id,
            event_id: row.event_id,
            ticket_type: row.ticket_type,
            quantity: row.quantity,
            unit_price: row.unit_price,
            total_price: row.total_price,
            status,
            seat_numbers,
            contact: UserContact {
                name: row.contact_name,
                email: row.contact_email,
                phone: row.contact_phone,
            },
            booked_at: row.booked_at,
        })
    }
}

/// Sum of quantities over a user's confirmed bookings for one event.
pub async fn active_quantity(pool: &SqlitePool, user_id: i64, event_id: i64) -> Result<i64> {
    let total: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(quantity), 0) FROM bookings \
         WHERE user_id = ? AND event_id = ? AND status = 'confirmed'",
    )
    .bind(user_id)
    .bind(event_id)
    .fetch_one(pool)
    .await?;
    Ok(total)
}

/// Append a ledger entry, but only if the user's confirmed total for the
/// event stays within the cap. The cap predicate rides inside the INSERT so
/// a concurrent booking by the same user cannot slip past it. Returns None
/// when the guard fails.
pub async fn insert_booking_capped(pool: &SqlitePool, new: &NewBooking) -> Result<Option<Booking>> {
    let seats = serde_json::to_string(&new.seat_numbers)?;
    let result = sqlx::query(
        "INSERT INTO bookings (user_id, event_id, ticket_type, quantity, unit_price, \
             total_price, status, seat_numbers, contact_name, contact_email, contact_phone) \
         SELECT ?, ?, ?, ?, ?, ?, 'confirmed', ?, ?, ?, ? \
         WHERE (SELECT COALESCE(SUM(quantity), 0) FROM bookings \
                WHERE user_id = ? AND event_id = ? AND status = 'confirmed') + ? <= ?",
    )
    .bind(new.user_id)
    .bind(new.event_id)
    .bind(&new.ticket_type)
    .bind(new.quantity)
    .bind(new.unit_price)
    .bind(new.total_price)
    .bind(&seats)
    .bind(&new.contact.name)
    .bind(&new.contact.email)
    .bind(&new.contact.phone)
    .bind(new.user_id)
    .bind(new.event_id)
    .bind(new.quantity)
    .bind(MAX_TICKETS_PER_EVENT)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    let booking = get_booking(pool, result.last_insert_rowid())
        .await?
        .ok_or_else(|| anyhow!("booking vanished after insert"))?;
    Ok(Some(booking))
}

pub async fn get_booking(pool: &SqlitePool, booking_id: i64) -> Result<Option<Booking>> {
    let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = ?");
    let row = sqlx::query_as::<_, BookingRow>(&sql)
        .bind(booking_id)
        .fetch_optional(pool)
        .await?;
    row.map(Booking::try_from).transpose()
}

/// A user's non-cancelled bookings, newest first.
pub async fn list_active_bookings(pool: &SqlitePool, user_id: i64) -> Result<Vec<Booking>> {
    let sql = format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings \
         WHERE user_id = ? AND status != 'cancelled' ORDER BY booked_at DESC, id DESC"
    );
    let rows = sqlx::query_as::<_, BookingRow>(&sql)
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(Booking::try_from).collect()
}

/// Flip a booking to cancelled. The status guard makes the flip atomic: of
/// two racing cancellations only one sees rows_affected > 0.
pub async fn mark_cancelled(pool: &SqlitePool, booking_id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE bookings SET status = 'cancelled' WHERE id = ? AND status = 'confirmed'",
    )
    .bind(booking_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use compass_models::NewTicketType;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        // Single connection: every handle sees the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    fn jazz_night() -> NewEvent {
        NewEvent {
            title: "Jazz Night".to_string(),
            date: "2030-06-01".to_string(),
            time: Some("20:00".to_string()),
            venue: "Galle Face".to_string(),
            organizer_email: None,
            price: 0,
            capacity: 0,
            ticket_types: vec![NewTicketType {
                name: "VIP".to_string(),
                unit_price: 5000,
                total_units: 10,
            }],
        }
    }

    fn booking_for(event_id: i64, user_id: i64, quantity: i64) -> NewBooking {
        NewBooking {
            user_id,
            event_id,
            ticket_type: "VIP".to_string(),
            quantity,
            unit_price: 5000,
            total_price: 5000 * quantity,
            seat_numbers: (0..quantity).map(|i| format!("V{}", 100 + i)).collect(),
            contact: UserContact {
                name: "Amara Silva".to_string(),
                email: "amara@example.com".to_string(),
                phone: None,
            },
        }
    }

    #[tokio::test]
    async fn reserve_decrements_and_fails_when_short() {
        let pool = test_pool().await;
        let event = create_event(&pool, &jazz_night()).await.unwrap();

        assert!(reserve_ticket_type(&pool, event.id, "VIP", 8).await.unwrap());
        let types = ticket_types_for_event(&pool, event.id).await.unwrap();
        assert_eq!(types[0].available_units, 2);

        // Only 2 left; a request for 3 must not fire.
        assert!(!reserve_ticket_type(&pool, event.id, "VIP", 3).await.unwrap());
        let types = ticket_types_for_event(&pool, event.id).await.unwrap();
        assert_eq!(types[0].available_units, 2);
    }

    #[tokio::test]
    async fn release_clamps_at_total_units() {
        let pool = test_pool().await;
        let event = create_event(&pool, &jazz_night()).await.unwrap();

        assert!(reserve_ticket_type(&pool, event.id, "VIP", 3).await.unwrap());
        release_ticket_type(&pool, event.id, "VIP", 3).await.unwrap();
        // Duplicate release must not push past the ceiling.
        release_ticket_type(&pool, event.id, "VIP", 3).await.unwrap();
        let types = ticket_types_for_event(&pool, event.id).await.unwrap();
        assert_eq!(types[0].available_units, 10);
    }

    #[tokio::test]
    async fn flat_capacity_reserve_and_clamped_release() {
        let pool = test_pool().await;
        let mut spec = jazz_night();
        spec.ticket_types.clear();
        spec.price = 800;
        spec.capacity = 50;
        let event = create_event(&pool, &spec).await.unwrap();

        assert!(reserve_capacity(&pool, event.id, 20).await.unwrap());
        assert!(!reserve_capacity(&pool, event.id, 40).await.unwrap());
        release_capacity(&pool, event.id, 20).await.unwrap();
        release_capacity(&pool, event.id, 20).await.unwrap();
        let event = get_event(&pool, event.id).await.unwrap().unwrap();
        assert_eq!(event.capacity, 50);
    }

    #[tokio::test]
    async fn capped_insert_rejects_past_five() {
        let pool = test_pool().await;
        let event = create_event(&pool, &jazz_night()).await.unwrap();

        let first = insert_booking_capped(&pool, &booking_for(event.id, 7, 3))
            .await
            .unwrap();
        assert!(first.is_some());
        assert_eq!(active_quantity(&pool, 7, event.id).await.unwrap(), 3);

        // 3 + 3 > 5: the guard inside the INSERT must refuse.
        let second = insert_booking_capped(&pool, &booking_for(event.id, 7, 3))
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(active_quantity(&pool, 7, event.id).await.unwrap(), 3);

        // A different user is unaffected.
        let other = insert_booking_capped(&pool, &booking_for(event.id, 8, 3))
            .await
            .unwrap();
        assert!(other.is_some());
    }

    #[tokio::test]
    async fn cancelled_bookings_drop_out_of_the_active_sum() {
        let pool = test_pool().await;
        let event = create_event(&pool, &jazz_night()).await.unwrap();

        let booking = insert_booking_capped(&pool, &booking_for(event.id, 7, 5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active_quantity(&pool, 7, event.id).await.unwrap(), 5);

        assert!(mark_cancelled(&pool, booking.id).await.unwrap());
        // Second flip loses the status guard.
        assert!(!mark_cancelled(&pool, booking.id).await.unwrap());
        assert_eq!(active_quantity(&pool, 7, event.id).await.unwrap(), 0);

        let active = list_active_bookings(&pool, 7).await.unwrap();
        assert!(active.is_empty());
        let stored = get_booking(&pool, booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Cancelled);
        assert_eq!(stored.seat_numbers.len(), 5);
    }
}
