//! Delivery side of the notification hub.
//!
//! The mailer resolves who a notification is for and hands the facts to a
//! transport. Transport failures are logged and dropped; the booking change
//! that produced the notification is already committed.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::notify::{Notification, NotifyError, Recipient};

/// Resolved destination for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// The configured staff inbox.
    StaffInbox(String),
    /// A requester; the web tier owns the address book.
    Requester(Ulid),
}

pub trait MailTransport: Send + Sync {
    fn deliver(&self, to: &Destination, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes each message to the log instead of sending it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

impl MailTransport for LogTransport {
    fn deliver(&self, to: &Destination, n: &Notification) -> Result<(), NotifyError> {
        info!(
            to = ?to,
            kind = n.kind.as_str(),
            booking = %n.booking_id,
            request = ?n.request_id,
            van = %n.van_name,
            start = %n.stay.start,
            end = %n.stay.end,
            total_price = n.total_price,
            "notification"
        );
        Ok(())
    }
}

pub struct Mailer {
    staff_email: String,
    transport: Arc<dyn MailTransport>,
}

impl Mailer {
    pub fn new(staff_email: String, transport: Arc<dyn MailTransport>) -> Self {
        Self { staff_email, transport }
    }

    pub fn destination(&self, recipient: Recipient) -> Destination {
        match recipient {
            Recipient::Staff => Destination::StaffInbox(self.staff_email.clone()),
            Recipient::Requester(id) => Destination::Requester(id),
        }
    }

    pub fn handle(&self, notification: &Notification) {
        let to = self.destination(notification.recipient);
        if let Err(e) = self.transport.deliver(&to, notification) {
            warn!(
                kind = notification.kind.as_str(),
                booking = %notification.booking_id,
                "notification delivery failed: {e}"
            );
            metrics::counter!(crate::observability::NOTIFICATION_FAILURES_TOTAL).increment(1);
        }
    }
}

/// Drain the hub until it closes.
pub async fn run_mailer(mut rx: broadcast::Receiver<Notification>, mailer: Mailer) {
    loop {
        match rx.recv().await {
            Ok(notification) => mailer.handle(&notification),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("mailer lagged, {skipped} notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
