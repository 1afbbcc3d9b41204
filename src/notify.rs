use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Amount, Stay};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ReservationReceived,
    PaymentConfirmed,
    BookingUpdated,
    BookingCancelled,
    ChangeRequestReceived,
    ChangeRequestApproved,
    ChangeRequestRejected,
    CancellationRequestReceived,
    CancellationRequestApproved,
    CancellationRequestRejected,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ReservationReceived => "reservation_received",
            NotificationKind::PaymentConfirmed => "payment_confirmed",
            NotificationKind::BookingUpdated => "booking_updated",
            NotificationKind::BookingCancelled => "booking_cancelled",
            NotificationKind::ChangeRequestReceived => "change_request_received",
            NotificationKind::ChangeRequestApproved => "change_request_approved",
            NotificationKind::ChangeRequestRejected => "change_request_rejected",
            NotificationKind::CancellationRequestReceived => "cancellation_request_received",
            NotificationKind::CancellationRequestApproved => "cancellation_request_approved",
            NotificationKind::CancellationRequestRejected => "cancellation_request_rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Requester(Ulid),
    Staff,
}

/// Structured facts about one state change. Wording and layout belong to
/// whoever delivers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: Recipient,
    pub booking_id: Ulid,
    pub request_id: Option<Ulid>,
    pub van_id: Ulid,
    pub van_name: String,
    pub requester_id: Ulid,
    /// Booking dates, or the proposed dates for change-request notices.
    pub stay: Stay,
    pub total_price: Amount,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification channel closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// The outbound "send notification" collaborator. Called after the state
/// change is durable; an error here never undoes it.
pub trait Notifier: Send + Sync {
    fn publish(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Broadcast hub. Delivery workers subscribe; publishing with nobody
/// listening is a no-op.
pub struct NotifyHub {
    sender: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Notifier for NotifyHub {
    fn publish(&self, notification: Notification) -> Result<(), NotifyError> {
        // Err only means there are no receivers right now.
        let _ = self.sender.send(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn sample(kind: NotificationKind) -> Notification {
        Notification {
            kind,
            recipient: Recipient::Staff,
            booking_id: Ulid::new(),
            request_id: None,
            van_id: Ulid::new(),
            van_name: "Californian".into(),
            requester_id: Ulid::new(),
            stay: Stay::new(
                NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2030, 1, 3).unwrap(),
            ),
            total_price: 200,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe();
        let n = sample(NotificationKind::ReservationReceived);
        hub.publish(n.clone()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), n);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        assert!(hub.publish(sample(NotificationKind::BookingCancelled)).is_ok());
    }

    #[test]
    fn kind_labels_are_distinct() {
        let kinds = [
            NotificationKind::ReservationReceived,
            NotificationKind::PaymentConfirmed,
            NotificationKind::BookingUpdated,
            NotificationKind::BookingCancelled,
            NotificationKind::ChangeRequestReceived,
            NotificationKind::ChangeRequestApproved,
            NotificationKind::ChangeRequestRejected,
            NotificationKind::CancellationRequestReceived,
            NotificationKind::CancellationRequestApproved,
            NotificationKind::CancellationRequestRejected,
        ];
        let labels: std::collections::HashSet<_> = kinds.iter().map(|k| k.as_str()).collect();
        assert_eq!(labels.len(), kinds.len());
    }
}
