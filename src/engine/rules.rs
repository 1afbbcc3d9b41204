use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Date policy applied to every new or moved stay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    /// A stay may start no earlier than `today + min_lead_days`.
    /// 0 allows same-day starts; only dates before today are "in the past".
    pub min_lead_days: u32,
}

impl BookingPolicy {
    pub fn earliest_start(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_add_days(Days::new(u64::from(self.min_lead_days)))
            .unwrap_or(NaiveDate::MAX)
    }
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::InvalidDateFormat(raw.to_string()))
}

/// Parse both dates before judging the range, so a bad format always wins
/// over a bad ordering.
pub(crate) fn parse_stay(start: &str, end: &str) -> Result<Stay, EngineError> {
    let start = parse_date(start)?;
    let end = parse_date(end)?;
    if end <= start {
        return Err(EngineError::InvalidDateRange);
    }
    Ok(Stay::new(start, end))
}

/// Reject stays that start before the policy allows, then the hard caps.
pub(crate) fn validate_new_stay(
    stay: &Stay,
    today: NaiveDate,
    policy: &BookingPolicy,
) -> Result<(), EngineError> {
    let earliest = policy.earliest_start(today);
    if stay.start < earliest {
        return Err(EngineError::DateInPast { earliest });
    }
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    if (stay.start - today).num_days() > MAX_BOOKING_HORIZON_DAYS {
        return Err(EngineError::LimitExceeded("stay starts too far ahead"));
    }
    Ok(())
}

/// A booking whose first night is today or earlier can no longer be touched
/// by its requester.
pub(crate) fn ensure_upcoming(booking: &Booking, today: NaiveDate) -> Result<(), EngineError> {
    if booking.stay.start <= today {
        return Err(EngineError::OngoingOrPast(booking.id));
    }
    Ok(())
}

/// Resolve a booking for its requester. Someone else's booking is reported
/// exactly like a missing one.
pub(crate) fn owned_booking<'a>(
    vs: &'a VanState,
    booking_id: Ulid,
    requester_id: Ulid,
) -> Result<&'a Booking, EngineError> {
    vs.booking(&booking_id)
        .filter(|b| b.requester_id == requester_id)
        .ok_or(EngineError::NotFound(booking_id))
}

pub(crate) fn validate_van(name: &str, daily_rate: Amount, capacity: u32) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Invalid("van name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("van name too long"));
    }
    validate_rate(daily_rate)?;
    if capacity == 0 {
        return Err(EngineError::Invalid("capacity must be at least 1"));
    }
    Ok(())
}

pub(crate) fn validate_rate(daily_rate: Amount) -> Result<(), EngineError> {
    if daily_rate <= 0 {
        return Err(EngineError::Invalid("daily rate must be positive"));
    }
    if daily_rate > MAX_DAILY_RATE {
        return Err(EngineError::LimitExceeded("daily rate too high"));
    }
    Ok(())
}
