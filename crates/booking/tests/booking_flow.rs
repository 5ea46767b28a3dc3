//! End-to-end coordinator tests against an in-memory database: the full
//! booking lifecycle, the per-user cap, oversubscription under concurrency,
//! and cancellation restoring inventory.

use std::sync::Arc;

use chrono::Utc;
use compass_booking::{BookingError, BookingRequest, cancel_booking, check_user_status,
    create_booking, create_booking_at, list_user_bookings};
use compass_models::{BookingStatus, Inventory, NewEvent, NewTicketType, UserContact};
use compass_notify::Mailer;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

async fn test_pool() -> SqlitePool {
    // Single connection so every handle shares the one in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    compass_db::migrate(&pool).await.unwrap();
    pool
}

async fn jazz_night(pool: &SqlitePool, vip_units: i64) -> i64 {
    let event = compass_db::create_event(
        pool,
        &NewEvent {
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
                total_units: vip_units,
            }],
        },
    )
    .await
    .unwrap();
    event.id
}

fn request(user_id: i64, event_id: i64, quantity: i64) -> BookingRequest {
    BookingRequest {
        user_id,
        event_id,
        ticket_type: Some("VIP".to_string()),
        quantity,
        contact: UserContact {
            name: "Amara Silva".to_string(),
            email: "amara@example.com".to_string(),
            phone: Some("0771234567".to_string()),
        },
    }
}

async fn vip_available(pool: &SqlitePool, event_id: i64) -> i64 {
    let types = compass_db::ticket_types_for_event(pool, event_id).await.unwrap();
    types.iter().find(|t| t.name == "VIP").unwrap().available_units
}

#[tokio::test]
async fn booking_reserves_units_and_prices_the_ledger_entry() {
    let pool = test_pool().await;
    let event_id = jazz_night(&pool, 10).await;
    let mailer = Arc::new(Mailer::Console);

    let booking = create_booking(&pool, &mailer, request(1, event_id, 3))
        .await
        .unwrap();

    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.ticket_type, "VIP");
    assert_eq!(booking.unit_price, 5000);
    assert_eq!(booking.total_price, 15000);
    assert_eq!(booking.seat_numbers.len(), 3);
    assert!(booking.seat_numbers.iter().all(|s| s.starts_with('V')));
    assert_eq!(booking.contact.email, "amara@example.com");
    assert_eq!(vip_available(&pool, event_id).await, 7);
}

#[tokio::test]
async fn cumulative_bookings_cannot_pass_the_cap() {
    let pool = test_pool().await;
    let event_id = jazz_night(&pool, 10).await;
    let now = Utc::now().naive_utc();

    create_booking_at(&pool, request(1, event_id, 3), now).await.unwrap();

    // 3 already booked; 3 more would make 6.
    let err = create_booking_at(&pool, request(1, event_id, 3), now)
        .await
        .unwrap_err();
    match err {
        BookingError::BookingCapExceeded { booked, remaining } => {
            assert_eq!(booked, 3);
            assert_eq!(remaining, 2);
        }
        other => panic!("expected BookingCapExceeded, got {other:?}"),
    }
    // The rejected request must not have touched inventory.
    assert_eq!(vip_available(&pool, event_id).await, 7);

    // Exactly the remaining allowance still goes through.
    create_booking_at(&pool, request(1, event_id, 2), now).await.unwrap();
    let status = check_user_status(&pool, 1, event_id).await.unwrap();
    assert_eq!(status.total_booked, 5);
    assert!(!status.can_book_more);
    assert_eq!(status.remaining_slots, 0);
}

#[tokio::test]
async fn insufficient_inventory_reports_live_availability() {
    let pool = test_pool().await;
    let event_id = jazz_night(&pool, 2).await;
    let now = Utc::now().naive_utc();

    let err = create_booking_at(&pool, request(2, event_id, 3), now)
        .await
        .unwrap_err();
    match err {
        BookingError::InsufficientInventory { bucket, available } => {
            assert_eq!(bucket, "VIP");
            assert_eq!(available, 2);
        }
        other => panic!("expected InsufficientInventory, got {other:?}"),
    }
    assert_eq!(vip_available(&pool, event_id).await, 2);
}

#[tokio::test]
async fn cancellation_restores_inventory_and_frees_the_cap() {
    let pool = test_pool().await;
    let event_id = jazz_night(&pool, 10).await;
    let now = Utc::now().naive_utc();

    let (booking, _) = create_booking_at(&pool, request(1, event_id, 3), now)
        .await
        .unwrap();
    assert_eq!(vip_available(&pool, event_id).await, 7);

    let cancelled = cancel_booking(&pool, booking.id, 1).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(vip_available(&pool, event_id).await, 10);

    let status = check_user_status(&pool, 1, event_id).await.unwrap();
    assert_eq!(status.total_booked, 0);
    assert_eq!(status.remaining_slots, 5);
    assert!(list_user_bookings(&pool, 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn recancelling_is_rejected_without_double_release() {
    let pool = test_pool().await;
    let event_id = jazz_night(&pool, 10).await;
    let now = Utc::now().naive_utc();

    let (booking, _) = create_booking_at(&pool, request(1, event_id, 4), now)
        .await
        .unwrap();
    cancel_booking(&pool, booking.id, 1).await.unwrap();

    let err = cancel_booking(&pool, booking.id, 1).await.unwrap_err();
    assert!(matches!(err, BookingError::AlreadyCancelled));
    assert_eq!(vip_available(&pool, event_id).await, 10);
}

#[tokio::test]
async fn cancellation_checks_ownership_and_existence() {
    let pool = test_pool().await;
    let event_id = jazz_night(&pool, 10).await;
    let now = Utc::now().naive_utc();

    let (booking, _) = create_booking_at(&pool, request(1, event_id, 2), now)
        .await
        .unwrap();

    let err = cancel_booking(&pool, booking.id, 99).await.unwrap_err();
    assert!(matches!(err, BookingError::Forbidden));

    let err = cancel_booking(&pool, 12345, 1).await.unwrap_err();
    assert!(matches!(err, BookingError::NotFound));

    // The failed attempts changed nothing.
    assert_eq!(vip_available(&pool, event_id).await, 8);
}

#[tokio::test]
async fn concurrent_requests_cannot_oversubscribe_a_bucket() {
    let pool = test_pool().await;
    let event_id = jazz_night(&pool, 7).await;
    let now = Utc::now().naive_utc();

    // Two users race for 5 tickets each with only 7 on the shelf.
    let a = create_booking_at(&pool, request(1, event_id, 5), now);
    let b = create_booking_at(&pool, request(2, event_id, 5), now);
    let (ra, rb) = tokio::join!(a, b);

    let oks = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(oks, 1, "exactly one of the racing bookings may succeed");
    for result in [ra, rb] {
        if let Err(e) = result {
            assert!(matches!(e, BookingError::InsufficientInventory { .. }));
        }
    }
    assert_eq!(vip_available(&pool, event_id).await, 2);
}

#[tokio::test]
async fn past_events_reject_bookings_regardless_of_inventory() {
    let pool = test_pool().await;
    let event = compass_db::create_event(
        &pool,
        &NewEvent {
            title: "Yesterday's Gala".to_string(),
            date: "2020-01-01".to_string(),
            time: Some("18:00".to_string()),
            venue: "Kandy".to_string(),
            organizer_email: None,
            price: 0,
            capacity: 0,
            ticket_types: vec![NewTicketType {
                name: "VIP".to_string(),
                unit_price: 5000,
                total_units: 100,
            }],
        },
    )
    .await
    .unwrap();

    let err = create_booking_at(&pool, request(1, event.id, 1), Utc::now().naive_utc())
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::EventExpired));
    assert_eq!(vip_available(&pool, event.id).await, 100);
}

#[tokio::test]
async fn flat_events_book_against_the_general_pool() {
    let pool = test_pool().await;
    let event = compass_db::create_event(
        &pool,
        &NewEvent {
            title: "Beach Festival".to_string(),
            date: "2030-03-03".to_string(),
            time: None,
            venue: "Mirissa".to_string(),
            organizer_email: None,
            price: 800,
            capacity: 50,
            ticket_types: vec![],
        },
    )
    .await
    .unwrap();
    let now = Utc::now().naive_utc();

    // Whatever name the client sends resolves to the implicit bucket.
    let mut req = request(1, event.id, 2);
    req.ticket_type = Some("Balcony".to_string());
    let (booking, _) = create_booking_at(&pool, req, now).await.unwrap();

    assert_eq!(booking.ticket_type, "General");
    assert_eq!(booking.unit_price, 800);
    assert_eq!(booking.total_price, 1600);
    assert!(booking.seat_numbers.iter().all(|s| s.starts_with('G')));

    let stored = compass_db::get_event(&pool, event.id).await.unwrap().unwrap();
    assert_eq!(stored.capacity, 48);

    cancel_booking(&pool, booking.id, 1).await.unwrap();
    let stored = compass_db::get_event(&pool, event.id).await.unwrap().unwrap();
    assert_eq!(stored.capacity, 50);
}

#[tokio::test]
async fn input_validation_comes_first() {
    let pool = test_pool().await;
    let event_id = jazz_night(&pool, 10).await;
    let now = Utc::now().naive_utc();

    for quantity in [0, 6, -1] {
        let err = create_booking_at(&pool, request(1, event_id, quantity), now)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::InvalidQuantity));
    }

    let mut req = request(1, event_id, 1);
    req.ticket_type = Some("Standing".to_string());
    let err = create_booking_at(&pool, req, now).await.unwrap_err();
    assert!(matches!(err, BookingError::InvalidBucket));

    let err = create_booking_at(&pool, request(1, 999, 1), now)
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::EventNotFound));
}

#[tokio::test]
async fn availability_always_equals_total_minus_confirmed_sum() {
    let pool = test_pool().await;
    let event_id = jazz_night(&pool, 10).await;
    let now = Utc::now().naive_utc();

    let (first, _) = create_booking_at(&pool, request(1, event_id, 3), now)
        .await
        .unwrap();
    create_booking_at(&pool, request(2, event_id, 4), now).await.unwrap();
    cancel_booking(&pool, first.id, 1).await.unwrap();

    let event = compass_db::get_event(&pool, event_id).await.unwrap().unwrap();
    let inventory = compass_db::load_inventory(&pool, &event).await.unwrap();
    let Inventory::Named(types) = inventory else {
        panic!("expected named buckets");
    };
    let vip = &types[0];

    let confirmed: i64 = compass_db::active_quantity(&pool, 1, event_id).await.unwrap()
        + compass_db::active_quantity(&pool, 2, event_id).await.unwrap();
    assert_eq!(vip.available_units, vip.total_units - confirmed);
    assert!(vip.available_units <= vip.total_units);
}
