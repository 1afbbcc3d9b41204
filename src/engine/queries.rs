use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability;
use super::rules::{owned_booking, parse_stay};
use super::{Engine, EngineError, SharedVanState};

fn booking_info(vs: &VanState, b: &Booking) -> BookingInfo {
    BookingInfo {
        id: b.id,
        van_id: vs.van.id,
        van_name: vs.van.name.clone(),
        requester_id: b.requester_id,
        stay: b.stay,
        total_price: b.total_price,
        status: b.status,
        created_at: b.created_at,
        cancellation_pending: vs.has_pending_cancellation(&b.id),
    }
}

impl Engine {
    fn all_vans(&self) -> Vec<SharedVanState> {
        self.vans.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn list_vans(&self) -> Vec<Van> {
        let mut vans = Vec::with_capacity(self.vans.len());
        for van in self.all_vans() {
            vans.push(van.read().await.van.clone());
        }
        vans.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        vans
    }

    /// One booking, visible only to the requester who owns it.
    pub async fn booking_for(&self, requester_id: Ulid, booking_id: Ulid) -> Result<BookingInfo, EngineError> {
        let guard = self.resolve_read(&booking_id).await?;
        let booking = owned_booking(&guard, booking_id, requester_id)?;
        Ok(booking_info(&guard, booking))
    }

    /// A requester's bookings, latest start first.
    pub async fn bookings_for_requester(&self, requester_id: Ulid) -> Vec<BookingInfo> {
        let mut out = Vec::new();
        for van in self.all_vans() {
            let guard = van.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.requester_id == requester_id)
                    .map(|b| booking_info(&guard, b)),
            );
        }
        out.sort_by(|a, b| b.stay.start.cmp(&a.stay.start).then(b.id.cmp(&a.id)));
        out
    }

    /// Staff view, oldest first.
    pub async fn change_requests(&self, pending_only: bool) -> Vec<ChangeRequestInfo> {
        let mut out = Vec::new();
        for van in self.all_vans() {
            let guard = van.read().await;
            for r in &guard.change_requests {
                if pending_only && r.status != RequestStatus::Pending {
                    continue;
                }
                let Some(b) = guard.booking(&r.booking_id) else { continue };
                out.push(ChangeRequestInfo {
                    id: r.id,
                    booking_id: r.booking_id,
                    van_id: guard.van.id,
                    requester_id: b.requester_id,
                    current: b.stay,
                    proposed: r.proposed,
                    status: r.status,
                    created_at: r.created_at,
                });
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn cancellation_requests(&self, pending_only: bool) -> Vec<CancellationRequestInfo> {
        let mut out = Vec::new();
        for van in self.all_vans() {
            let guard = van.read().await;
            for r in &guard.cancellation_requests {
                if pending_only && r.status != RequestStatus::Pending {
                    continue;
                }
                let Some(b) = guard.booking(&r.booking_id) else { continue };
                out.push(CancellationRequestInfo {
                    id: r.id,
                    booking_id: r.booking_id,
                    van_id: guard.van.id,
                    requester_id: b.requester_id,
                    stay: b.stay,
                    status: r.status,
                    created_at: r.created_at,
                });
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn check_availability(&self, van_id: Ulid, start: &str, end: &str) -> Result<bool, EngineError> {
        let stay = parse_stay(start, end)?;
        let van = self.van(&van_id).ok_or(EngineError::NotFound(van_id))?;
        let guard = van.read().await;
        Ok(availability::is_available(&guard, &stay, None))
    }

    /// Maximal free windows inside `[from, to)`.
    pub async fn free_windows(&self, van_id: Ulid, from: &str, to: &str) -> Result<Vec<Stay>, EngineError> {
        let window = parse_stay(from, to)?;
        if window.nights() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let van = self.van(&van_id).ok_or(EngineError::NotFound(van_id))?;
        let guard = van.read().await;
        Ok(availability::free_windows(&guard, &window))
    }
}
