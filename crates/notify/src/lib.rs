//! Booking confirmation notifications. Delivery is best-effort and runs
//! detached from the booking transaction; failures are logged, never
//! surfaced to the caller.

use std::sync::Arc;

use anyhow::{Context, Result};
use compass_models::{Booking, Event};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use lettre::message::Mailbox;
use tracing::{info, warn};

/// Outbound mail channel. Console is the development default when SMTP is
/// not configured.
pub enum Mailer {
    Console,
    Smtp(SmtpMailer),
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

impl Mailer {
    pub fn smtp(settings: &SmtpSettings) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.server)?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .build();
        let from = settings
            .from
            .parse::<Mailbox>()
            .with_context(|| format!("invalid from address: {}", settings.from))?;
        Ok(Mailer::Smtp(SmtpMailer { transport, from }))
    }

    pub async fn send_booking_confirmation(&self, booking: &Booking, event: &Event) -> Result<()> {
        let subject = format!("Booking Confirmed – {}", event.title);
        let body = confirmation_body(booking, event);
        match self {
            Mailer::Console => {
                info!(
                    "Email (console) to {}: {subject}\n{body}",
                    booking.contact.email
                );
                Ok(())
            }
            Mailer::Smtp(smtp) => {
                let message = Message::builder()
                    .from(smtp.from.clone())
                    .to(booking.contact.email.parse::<Mailbox>()?)
                    .subject(subject)
                    .header(ContentType::TEXT_PLAIN)
                    .body(body)?;
                smtp.transport.send(message).await?;
                Ok(())
            }
        }
    }
}

/// Hand the confirmation to a detached task. The booking result is already
/// decided; a slow or failing mail server must not touch it.
pub fn spawn_confirmation(mailer: Arc<Mailer>, booking: Booking, event: Event) {
    tokio::spawn(async move {
        if let Err(e) = mailer.send_booking_confirmation(&booking, &event).await {
            warn!("Failed to send confirmation for booking {}: {e:#}", booking.id);
        }
    });
}

fn confirmation_body(booking: &Booking, event: &Event) -> String {
    let when = match &event.time {
        Some(t) => format!("{} at {t}", event.date),
        None => event.date.clone(),
    };
    format!(
        "Hello {},\n\n\
         Your booking is confirmed!\n\n\
         Event: {}\n\
         When: {when}\n\
         Venue: {}\n\
         Ticket type: {}\n\
         Seats: {}\n\
         Quantity: {}\n\
         Total: {}\n\n\
         Booking reference: {}\n",
        booking.contact.name,
        event.title,
        event.venue,
        booking.ticket_type,
        booking.seat_numbers.join(", "),
        booking.quantity,
        booking.total_price,
        booking.id,
    )
}
