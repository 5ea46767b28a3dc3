use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use compass_booking::{BookingError, BookingRequest};
use compass_config::Config;
use compass_models::{Event, Inventory, NewEvent, NewTicketType, UserContact};
use compass_notify::{Mailer, SmtpSettings};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::OffsetTime;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_HASH: &str = env!("COMPASS_GIT_HASH");

fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH})")
}

// --- CLI definition ---

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Parser)]
#[command(name = "compass")]
#[command(about = "Compass event booking service")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("COMPASS_GIT_HASH"), ")"))]
struct Cli {
    /// Log level
    #[arg(short, long, global = true)]
    log_level: Option<LogLevel>,

    /// Display log timestamps in UTC (default: local time)
    #[arg(long, global = true)]
    utc: bool,

    /// Database URL
    #[arg(long, global = true)]
    db_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Add an event to the listing store
    AddEvent {
        /// Event title
        #[arg(long)]
        title: String,
        /// Date (YYYY-MM-DD)
        #[arg(long)]
        date: String,
        /// Start time (HH:MM)
        #[arg(long)]
        time: Option<String>,
        /// Venue name
        #[arg(long, default_value = "")]
        venue: String,
        /// Flat unit price (events without ticket types)
        #[arg(long, default_value_t = 0)]
        price: i64,
        /// Flat capacity (events without ticket types)
        #[arg(long, default_value_t = 0)]
        capacity: i64,
        /// Named ticket type as name:price:units (repeatable, e.g. VIP:5000:10)
        #[arg(long = "ticket-type")]
        ticket_types: Vec<String>,
    },
    /// List events with live availability
    ListEvents,
    /// List a user's active bookings
    ListBookings {
        /// User id
        #[arg(long)]
        user: i64,
    },
}

// --- Logging ---

fn init_logging(log_level: &str, utc: bool) {
    let filter = EnvFilter::new(log_level);

    if utc {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(OffsetTime::new(
                time::UtcOffset::UTC,
                time::macros::format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
                ),
            ))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(LocalTimer)
            .init();
    }
}

struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

// --- Server ---

#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
    mailer: Arc<Mailer>,
}

/// Booking rejections map to caller-visible statuses; unexpected storage
/// faults stay generic so no internal detail leaks.
fn error_response(e: BookingError) -> (StatusCode, String) {
    match e {
        BookingError::EventNotFound | BookingError::NotFound => {
            (StatusCode::NOT_FOUND, e.to_string())
        }
        BookingError::Forbidden => (StatusCode::FORBIDDEN, e.to_string()),
        BookingError::Storage(inner) => {
            error!("Storage error: {inner:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Server error".to_string())
        }
        _ => (StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": version_string()
    }))
}

async fn api_list_events(
    State(state): State<AppState>,
) -> Result<Json<Vec<Event>>, (StatusCode, String)> {
    compass_db::list_events(&state.pool)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn api_create_event(
    State(state): State<AppState>,
    Json(body): Json<NewEvent>,
) -> Result<Json<Event>, (StatusCode, String)> {
    let event = compass_db::create_event(&state.pool, &body)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    info!("Event {} added: {}", event.id, event.title);
    Ok(Json(event))
}

async fn api_get_event(
    State(state): State<AppState>,
    Path(event_id): Path<i64>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let event = compass_db::get_event(&state.pool, event_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, "Event not found".to_string()))?;
    let inventory = compass_db::load_inventory(&state.pool, &event)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({
        "event": event,
        "buckets": bucket_views(&inventory),
    })))
}

/// Availability payload for listing pages. Sold-out buckets stay listed.
fn bucket_views(inventory: &Inventory) -> Vec<serde_json::Value> {
    match inventory {
        Inventory::Named(types) => types
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "unit_price": t.unit_price,
                    "total_units": t.total_units,
                    "available_units": t.available_units,
                })
            })
            .collect(),
        Inventory::Flat { unit_price, available, total } => vec![json!({
            "name": compass_models::GENERAL_BUCKET,
            "unit_price": unit_price,
            "total_units": total,
            "available_units": available,
        })],
    }
}

#[derive(Deserialize)]
struct CreateBookingRequest {
    user_id: i64,
    event_id: i64,
    ticket_type: Option<String>,
    quantity: i64,
    name: String,
    email: String,
    phone: Option<String>,
}

async fn api_create_booking(
    State(state): State<AppState>,
    Json(body): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    let request = BookingRequest {
        user_id: body.user_id,
        event_id: body.event_id,
        ticket_type: body.ticket_type,
        quantity: body.quantity,
        contact: UserContact {
            name: body.name,
            email: body.email,
            phone: body.phone,
        },
    };
    let booking = compass_booking::create_booking(&state.pool, &state.mailer, request)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Booking confirmed successfully!",
            "booking": booking,
        })),
    ))
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: i64,
}

async fn api_my_bookings(
    State(state): State<AppState>,
    Query(params): Query<UserQuery>,
) -> Result<Json<Vec<compass_models::Booking>>, (StatusCode, String)> {
    compass_booking::list_user_bookings(&state.pool, params.user_id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn api_check_booking(
    State(state): State<AppState>,
    Path(event_id): Path<i64>,
    Query(params): Query<UserQuery>,
) -> Result<Json<compass_models::StatusSummary>, (StatusCode, String)> {
    compass_booking::check_user_status(&state.pool, params.user_id, event_id)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Deserialize)]
struct CancelRequest {
    user_id: i64,
}

async fn api_cancel_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<i64>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let booking = compass_booking::cancel_booking(&state.pool, booking_id, body.user_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "message": "Booking cancelled successfully",
        "booking": booking,
    })))
}

async fn run_server(port: u16, state: AppState) -> anyhow::Result<()> {
    info!("Compass v{}", version_string());

    let api_routes = Router::new()
        .route("/health", get(health))
        .route("/events", get(api_list_events).post(api_create_event))
        .route("/events/{id}", get(api_get_event))
        .route("/bookings", post(api_create_booking))
        .route("/bookings/my-bookings", get(api_my_bookings))
        .route("/bookings/check/{event_id}", get(api_check_booking))
        .route("/bookings/{id}/cancel", put(api_cancel_booking));

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    info!("Listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- CLI helpers ---

/// Parse a `name:price:units` ticket-type argument.
fn parse_ticket_type(arg: &str) -> anyhow::Result<NewTicketType> {
    let mut parts = arg.rsplitn(3, ':');
    let units = parts.next().context("missing units")?;
    let price = parts.next().context("missing price")?;
    let name = parts.next().context("expected name:price:units")?;
    Ok(NewTicketType {
        name: name.to_string(),
        unit_price: price.parse().with_context(|| format!("bad price in {arg:?}"))?,
        total_units: units.parse().with_context(|| format!("bad units in {arg:?}"))?,
    })
}

fn availability_summary(inventory: &Inventory) -> String {
    match inventory {
        Inventory::Named(types) => types
            .iter()
            .map(|t| format!("{} {}/{}", t.name, t.available_units, t.total_units))
            .collect::<Vec<_>>()
            .join(", "),
        Inventory::Flat { available, total, .. } => format!("{available}/{total}"),
    }
}

// --- Main ---

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Layer CLI args over file/env config.
    let mut config = Config::load();
    if let Some(level) = &cli.log_level {
        config.log_level = level.to_string();
    }
    if cli.utc {
        config.utc = true;
    }
    if let Some(url) = &cli.db_url {
        config.db_url = url.clone();
    }

    init_logging(&config.log_level, config.utc);

    let pool = compass_db::connect(&config.db_url).await?;
    compass_db::migrate(&pool).await?;

    match cli.command {
        Commands::Serve { port } => {
            let mailer = match &config.smtp_server {
                Some(server) => Mailer::smtp(&SmtpSettings {
                    server: server.clone(),
                    port: config.smtp_port,
                    username: config.smtp_username.clone(),
                    password: config.smtp_password.clone(),
                    from: config.smtp_from.clone(),
                })?,
                None => {
                    info!("SMTP not configured, confirmation emails go to the log");
                    Mailer::Console
                }
            };
            let state = AppState { pool, mailer: Arc::new(mailer) };
            run_server(port.unwrap_or(config.port), state).await?;
        }
        Commands::AddEvent { title, date, time, venue, price, capacity, ticket_types } => {
            let ticket_types = ticket_types
                .iter()
                .map(|arg| parse_ticket_type(arg))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let event = compass_db::create_event(
                &pool,
                &NewEvent {
                    title,
                    date,
                    time,
                    venue,
                    organizer_email: None,
                    price,
                    capacity,
                    ticket_types,
                },
            )
            .await?;
            let inventory = compass_db::load_inventory(&pool, &event).await?;
            println!("Added event: {} on {} (id={})", event.title, event.date, event.id);
            println!("Inventory: {}", availability_summary(&inventory));
        }
        Commands::ListEvents => {
            let events = compass_db::list_events(&pool).await?;
            if events.is_empty() {
                println!("No events found. Use `compass add-event` to add one.");
            } else {
                println!(
                    "{:<6} {:<12} {:<8} {:<30} {:<20} {}",
                    "ID", "Date", "Time", "Title", "Venue", "Availability"
                );
                println!("{}", "-".repeat(100));
                for e in &events {
                    let inventory = compass_db::load_inventory(&pool, e).await?;
                    println!(
                        "{:<6} {:<12} {:<8} {:<30} {:<20} {}",
                        e.id,
                        e.date,
                        e.time.as_deref().unwrap_or("-"),
                        e.title,
                        e.venue,
                        availability_summary(&inventory),
                    );
                }
                println!("\n{} event(s) total", events.len());
            }
        }
        Commands::ListBookings { user } => {
            let bookings = compass_booking::list_user_bookings(&pool, user).await?;
            if bookings.is_empty() {
                println!("No active bookings for user {user}.");
            } else {
                println!(
                    "{:<6} {:<8} {:<12} {:<6} {:<10} {}",
                    "ID", "Event", "Type", "Qty", "Total", "Seats"
                );
                println!("{}", "-".repeat(70));
                for b in &bookings {
                    println!(
                        "{:<6} {:<8} {:<12} {:<6} {:<10} {}",
                        b.id,
                        b.event_id,
                        b.ticket_type,
                        b.quantity,
                        b.total_price,
                        b.seat_numbers.join(", "),
                    );
                }
                println!("\n{} booking(s) total", bookings.len());
            }
        }
    }

    Ok(())
}
