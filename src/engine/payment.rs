use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{NotificationKind, Recipient};

use super::{Engine, EngineError};

impl Engine {
    /// Apply a payment-completion event. Safe under duplicate and
    /// out-of-order delivery: only Pending → Confirmed mutates anything, and
    /// every other case reports an outcome instead of failing. The only
    /// error is a storage failure, which the provider should retry.
    pub async fn confirm_via_payment(&self, booking_id: Ulid) -> Result<PaymentOutcome, EngineError> {
        let mut guard = match self.resolve_write(&booking_id).await {
            Ok(guard) => guard,
            Err(EngineError::NotFound(_)) => {
                warn!(booking = %booking_id, "payment for unknown booking ignored");
                return Ok(PaymentOutcome::UnknownBooking);
            }
            Err(e) => return Err(e),
        };
        let Some(status) = guard.booking(&booking_id).map(|b| b.status) else {
            // The id names a request, not a booking.
            warn!(booking = %booking_id, "payment for unknown booking ignored");
            return Ok(PaymentOutcome::UnknownBooking);
        };

        match status {
            BookingStatus::Confirmed => {
                info!(booking = %booking_id, "duplicate payment event");
                Ok(PaymentOutcome::AlreadyConfirmed)
            }
            BookingStatus::Cancelled => {
                warn!(booking = %booking_id, "payment for cancelled booking ignored");
                Ok(PaymentOutcome::Ignored)
            }
            BookingStatus::Pending => {
                let event = Event::BookingConfirmed {
                    id: booking_id,
                    van_id: guard.van.id,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                let booking = guard
                    .booking(&booking_id)
                    .cloned()
                    .ok_or(EngineError::NotFound(booking_id))?;
                info!(booking = %booking_id, amount = booking.total_price, "booking confirmed by payment");
                self.notify(
                    NotificationKind::PaymentConfirmed,
                    Recipient::Requester(booking.requester_id),
                    &guard,
                    &booking,
                    None,
                    booking.stay,
                );
                Ok(PaymentOutcome::Confirmed)
            }
        }
    }
}
