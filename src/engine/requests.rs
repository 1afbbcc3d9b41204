use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{NotificationKind, Recipient};

use super::availability::first_conflict;
use super::rules::{ensure_upcoming, owned_booking, parse_stay, validate_new_stay};
use super::{Engine, EngineError};

// ── Change requests ──────────────────────────────────────────────

impl Engine {
    /// Propose new dates for a Confirmed booking. Availability is left to
    /// approval time, since the calendar can move in between.
    pub async fn request_change(
        &self,
        id: Ulid,
        booking_id: Ulid,
        requester_id: Ulid,
        start: &str,
        end: &str,
    ) -> Result<ChangeRequest, EngineError> {
        let mut guard = self.resolve_write(&booking_id).await?;
        let reservation = self.reserve_id(id, guard.van.id)?;
        let booking = owned_booking(&guard, booking_id, requester_id)?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::NotConfirmed(booking_id));
        }
        ensure_upcoming(booking, self.today())?;
        let proposed = parse_stay(start, end)?;
        validate_new_stay(&proposed, self.today(), &self.policy)?;
        if guard.change_requests.len() >= MAX_REQUESTS_PER_VAN {
            return Err(EngineError::LimitExceeded("too many change requests on van"));
        }

        let event = Event::ChangeRequested {
            id,
            booking_id,
            van_id: guard.van.id,
            proposed,
            created_at: self.now(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        reservation.commit();
        let request = guard.change_request(&id).cloned().ok_or(EngineError::NotFound(id))?;
        let booking = guard.booking(&booking_id).cloned().ok_or(EngineError::NotFound(booking_id))?;
        info!(request = %id, booking = %booking_id, "change requested");
        for recipient in [Recipient::Requester(requester_id), Recipient::Staff] {
            self.notify(
                NotificationKind::ChangeRequestReceived,
                recipient,
                &guard,
                &booking,
                Some(id),
                proposed,
            );
        }
        Ok(request)
    }

    /// Re-check the proposed dates against the live calendar and move the
    /// booking. Booking and request change in one WAL record.
    pub async fn approve_change(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_write(&id).await?;
        let request = guard.change_request(&id).ok_or(EngineError::NotFound(id))?;
        if request.status != RequestStatus::Pending {
            return Err(EngineError::NotPending(id));
        }
        let (booking_id, proposed) = (request.booking_id, request.proposed);
        let booking = guard.booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::NotConfirmed(booking_id));
        }
        if let Some(existing) = first_conflict(&guard, &proposed, Some(booking_id)) {
            debug!(request = %id, %existing, "approval rejected: dates taken");
            return Err(EngineError::NotAvailable);
        }

        let event = Event::ChangeApproved {
            id,
            booking_id,
            van_id: guard.van.id,
            stay: proposed,
            total_price: proposed.quote(guard.van.daily_rate),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let booking = guard.booking(&booking_id).cloned().ok_or(EngineError::NotFound(booking_id))?;
        info!(request = %id, booking = %booking_id, "change approved");
        self.notify(
            NotificationKind::ChangeRequestApproved,
            Recipient::Requester(booking.requester_id),
            &guard,
            &booking,
            Some(id),
            booking.stay,
        );
        Ok(booking)
    }

    pub async fn reject_change(&self, id: Ulid) -> Result<ChangeRequest, EngineError> {
        let mut guard = self.resolve_write(&id).await?;
        let request = guard.change_request(&id).ok_or(EngineError::NotFound(id))?;
        if request.status != RequestStatus::Pending {
            return Err(EngineError::NotPending(id));
        }
        let (booking_id, proposed) = (request.booking_id, request.proposed);

        let event = Event::ChangeRejected {
            id,
            van_id: guard.van.id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let request = guard.change_request(&id).cloned().ok_or(EngineError::NotFound(id))?;
        info!(request = %id, booking = %booking_id, "change rejected");
        if let Some(booking) = guard.booking(&booking_id) {
            self.notify(
                NotificationKind::ChangeRequestRejected,
                Recipient::Requester(booking.requester_id),
                &guard,
                booking,
                Some(id),
                proposed,
            );
        }
        Ok(request)
    }
}

// ── Cancellation requests ────────────────────────────────────────

impl Engine {
    pub async fn request_cancellation(
        &self,
        id: Ulid,
        booking_id: Ulid,
        requester_id: Ulid,
    ) -> Result<CancellationRequest, EngineError> {
        let mut guard = self.resolve_write(&booking_id).await?;
        let reservation = self.reserve_id(id, guard.van.id)?;
        let booking = owned_booking(&guard, booking_id, requester_id)?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::NotConfirmed(booking_id));
        }
        ensure_upcoming(booking, self.today())?;
        if guard.has_pending_cancellation(&booking_id) {
            return Err(EngineError::DuplicatePending(booking_id));
        }
        if guard.cancellation_requests.len() >= MAX_REQUESTS_PER_VAN {
            return Err(EngineError::LimitExceeded("too many cancellation requests on van"));
        }

        let event = Event::CancellationRequested {
            id,
            booking_id,
            van_id: guard.van.id,
            created_at: self.now(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        reservation.commit();
        let request = guard
            .cancellation_request(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        info!(request = %id, booking = %booking_id, "cancellation requested");
        if let Some(booking) = guard.booking(&booking_id) {
            self.notify(
                NotificationKind::CancellationRequestReceived,
                Recipient::Staff,
                &guard,
                booking,
                Some(id),
                booking.stay,
            );
        }
        Ok(request)
    }

    /// The single place a Confirmed booking becomes Cancelled.
    pub async fn approve_cancellation(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_write(&id).await?;
        let request = guard.cancellation_request(&id).ok_or(EngineError::NotFound(id))?;
        if request.status != RequestStatus::Pending {
            return Err(EngineError::NotPending(id));
        }
        let booking_id = request.booking_id;
        let booking = guard.booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::AlreadyCancelled(booking_id));
        }

        let event = Event::CancellationApproved {
            id,
            booking_id,
            van_id: guard.van.id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let booking = guard.booking(&booking_id).cloned().ok_or(EngineError::NotFound(booking_id))?;
        info!(request = %id, booking = %booking_id, "cancellation approved");
        self.notify(
            NotificationKind::CancellationRequestApproved,
            Recipient::Requester(booking.requester_id),
            &guard,
            &booking,
            Some(id),
            booking.stay,
        );
        Ok(booking)
    }

    pub async fn reject_cancellation(&self, id: Ulid) -> Result<CancellationRequest, EngineError> {
        let mut guard = self.resolve_write(&id).await?;
        let request = guard.cancellation_request(&id).ok_or(EngineError::NotFound(id))?;
        if request.status != RequestStatus::Pending {
            return Err(EngineError::NotPending(id));
        }
        let booking_id = request.booking_id;

        let event = Event::CancellationRejected {
            id,
            van_id: guard.van.id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let request = guard
            .cancellation_request(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        info!(request = %id, booking = %booking_id, "cancellation rejected");
        if let Some(booking) = guard.booking(&booking_id) {
            self.notify(
                NotificationKind::CancellationRequestRejected,
                Recipient::Requester(booking.requester_id),
                &guard,
                booking,
                Some(id),
                booking.stay,
            );
        }
        Ok(request)
    }
}
