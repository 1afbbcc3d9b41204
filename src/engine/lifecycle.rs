use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{NotificationKind, Recipient};
use crate::observability::BOOKINGS_TOTAL;

use super::availability::first_conflict;
use super::rules::{ensure_upcoming, owned_booking, parse_stay, validate_new_stay, validate_rate, validate_van};
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_van(
        &self,
        id: Ulid,
        name: String,
        daily_rate: Amount,
        capacity: u32,
    ) -> Result<Van, EngineError> {
        validate_van(&name, daily_rate, capacity)?;
        let _catalog = self.catalog.lock().await;
        if self.vans.len() >= MAX_VANS {
            return Err(EngineError::LimitExceeded("too many vans"));
        }
        if self.vans.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::VanAdded {
            id,
            name: name.clone(),
            daily_rate,
            capacity,
        };
        self.wal_append(&event).await?;
        let van = Van {
            id,
            name,
            daily_rate,
            capacity,
        };
        self.vans
            .insert(id, Arc::new(RwLock::new(VanState::new(van.clone()))));
        metrics::counter!(crate::observability::EVENTS_COMMITTED_TOTAL, "event" => "van_added")
            .increment(1);
        info!(van = %id, name = %van.name, daily_rate, "van added");
        Ok(van)
    }

    /// New rate applies to future quotes only; existing prices are snapshots.
    pub async fn reprice_van(&self, id: Ulid, daily_rate: Amount) -> Result<Van, EngineError> {
        validate_rate(daily_rate)?;
        let van = self.van(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = van.write().await;
        let event = Event::VanRepriced { id, daily_rate };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(van = %id, daily_rate, "van repriced");
        Ok(guard.van.clone())
    }

    pub async fn create_booking(
        &self,
        id: Ulid,
        van_id: Ulid,
        requester_id: Ulid,
        start: &str,
        end: &str,
    ) -> Result<Booking, EngineError> {
        let stay = parse_stay(start, end)?;
        validate_new_stay(&stay, self.today(), &self.policy)?;

        let van = self.van(&van_id).ok_or(EngineError::NotFound(van_id))?;
        let reservation = self.reserve_id(id, van_id)?;
        let mut guard = van.write_owned().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_VAN {
            return Err(EngineError::LimitExceeded("too many bookings on van"));
        }
        if let Some(existing) = first_conflict(&guard, &stay, None) {
            debug!(van = %van_id, %existing, "create rejected: dates taken");
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "not_available").increment(1);
            return Err(EngineError::NotAvailable);
        }

        let event = Event::BookingCreated {
            id,
            van_id,
            requester_id,
            stay,
            total_price: stay.quote(guard.van.daily_rate),
            created_at: self.now(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        reservation.commit();
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => "created").increment(1);
        info!(booking = %id, van = %van_id, start = %stay.start, end = %stay.end, "booking created");
        self.notify(
            NotificationKind::ReservationReceived,
            Recipient::Requester(requester_id),
            &guard,
            &booking,
            None,
            booking.stay,
        );
        Ok(booking)
    }

    /// Move a Pending, upcoming booking to new dates and re-quote it.
    pub async fn edit_booking(
        &self,
        id: Ulid,
        requester_id: Ulid,
        start: &str,
        end: &str,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_write(&id).await?;
        let current = owned_booking(&guard, id, requester_id)?;
        if current.status != BookingStatus::Pending {
            return Err(EngineError::NotPending(id));
        }
        ensure_upcoming(current, self.today())?;

        let stay = parse_stay(start, end)?;
        validate_new_stay(&stay, self.today(), &self.policy)?;
        if let Some(existing) = first_conflict(&guard, &stay, Some(id)) {
            debug!(booking = %id, %existing, "edit rejected: dates taken");
            return Err(EngineError::NotAvailable);
        }

        let event = Event::BookingRescheduled {
            id,
            van_id: guard.van.id,
            stay,
            total_price: stay.quote(guard.van.daily_rate),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        info!(booking = %id, start = %stay.start, end = %stay.end, "booking edited");
        self.notify(
            NotificationKind::BookingUpdated,
            Recipient::Requester(requester_id),
            &guard,
            &booking,
            None,
            booking.stay,
        );
        Ok(booking)
    }

    /// Requester-initiated cancel. Confirmed bookings go through a
    /// cancellation request instead.
    pub async fn cancel_booking(&self, id: Ulid, requester_id: Ulid) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_write(&id).await?;
        let current = owned_booking(&guard, id, requester_id)?;
        if current.status == BookingStatus::Cancelled {
            return Err(EngineError::AlreadyCancelled(id));
        }
        ensure_upcoming(current, self.today())?;
        if current.status == BookingStatus::Confirmed {
            return Err(EngineError::RequiresApproval(id));
        }

        let event = Event::BookingCancelled {
            id,
            van_id: guard.van.id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        info!(booking = %id, "booking cancelled by requester");
        self.notify(
            NotificationKind::BookingCancelled,
            Recipient::Requester(requester_id),
            &guard,
            &booking,
            None,
            booking.stay,
        );
        Ok(booking)
    }

    /// Read-only precondition for opening a payment session.
    pub async fn begin_checkout(
        &self,
        booking_id: Ulid,
        requester_id: Ulid,
    ) -> Result<CheckoutQuote, EngineError> {
        let guard = self.resolve_read(&booking_id).await?;
        let booking = owned_booking(&guard, booking_id, requester_id)?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::NotPending(booking_id));
        }
        ensure_upcoming(booking, self.today())?;
        Ok(CheckoutQuote {
            booking_id,
            van_name: guard.van.name.clone(),
            stay: booking.stay,
            amount: booking.total_price,
        })
    }
}
