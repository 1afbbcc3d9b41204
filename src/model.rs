use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Money in minor currency units (cents).
pub type Amount = i64;

/// Half-open calendar range `[start, end)`. The end date is the checkout day and
/// is not occupied, so back-to-back stays share a boundary without overlapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Stay {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "Stay start must be before end");
        Self { start, end }
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &Stay) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Price of this stay at the given nightly rate. Callers keep the rate
    /// and stay length within `limits`, which keeps the product in range.
    pub fn quote(&self, daily_rate: Amount) -> Amount {
        self.nights() * daily_rate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    /// Terminal. Frees the calendar.
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Pending and Confirmed bookings occupy the calendar.
    pub fn is_active(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

/// Status shared by change and cancellation requests. Approved and Rejected are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(RequestStatus::Pending),
            "approved" => Some(RequestStatus::Approved),
            "rejected" => Some(RequestStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Van {
    pub id: Ulid,
    pub name: String,
    pub daily_rate: Amount,
    /// Number of travellers the van sleeps.
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub van_id: Ulid,
    pub requester_id: Ulid,
    pub stay: Stay,
    /// Snapshot of `stay.nights() * daily_rate` taken at the last date mutation.
    pub total_price: Amount,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub proposed: Stay,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationRequest {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

/// Everything hanging off one van. Guarded by a single lock so that the
/// availability check and the write that depends on it are one atomic unit.
#[derive(Debug, Clone)]
pub struct VanState {
    pub van: Van,
    /// All bookings including cancelled ones, sorted by `stay.start`.
    pub bookings: Vec<Booking>,
    pub change_requests: Vec<ChangeRequest>,
    pub cancellation_requests: Vec<CancellationRequest>,
}

impl VanState {
    pub fn new(van: Van) -> Self {
        Self {
            van,
            bookings: Vec::new(),
            change_requests: Vec::new(),
            cancellation_requests: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by stay.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.stay.start <= booking.stay.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Move a booking to new dates, keeping the vector sorted.
    pub fn reschedule(&mut self, id: Ulid, stay: Stay, total_price: Amount) {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            let mut booking = self.bookings.remove(pos);
            booking.stay = stay;
            booking.total_price = total_price;
            self.insert_booking(booking);
        }
    }

    /// Bookings whose stay overlaps the query window, cancelled ones included.
    /// Binary search skips everything starting on or after `query.end`.
    pub fn overlapping(&self, query: &Stay) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.stay.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.stay.end > query.start)
    }

    pub fn change_request(&self, id: &Ulid) -> Option<&ChangeRequest> {
        self.change_requests.iter().find(|r| r.id == *id)
    }

    pub fn change_request_mut(&mut self, id: &Ulid) -> Option<&mut ChangeRequest> {
        self.change_requests.iter_mut().find(|r| r.id == *id)
    }

    pub fn cancellation_request(&self, id: &Ulid) -> Option<&CancellationRequest> {
        self.cancellation_requests.iter().find(|r| r.id == *id)
    }

    pub fn cancellation_request_mut(&mut self, id: &Ulid) -> Option<&mut CancellationRequest> {
        self.cancellation_requests.iter_mut().find(|r| r.id == *id)
    }

    pub fn has_pending_cancellation(&self, booking_id: &Ulid) -> bool {
        self.cancellation_requests
            .iter()
            .any(|r| r.booking_id == *booking_id && r.status == RequestStatus::Pending)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
/// Every event after `VanAdded` names the van it belongs to so replay can
/// route it without any other index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VanAdded {
        id: Ulid,
        name: String,
        daily_rate: Amount,
        capacity: u32,
    },
    VanRepriced {
        id: Ulid,
        daily_rate: Amount,
    },
    BookingCreated {
        id: Ulid,
        van_id: Ulid,
        requester_id: Ulid,
        stay: Stay,
        total_price: Amount,
        created_at: DateTime<Utc>,
    },
    BookingRescheduled {
        id: Ulid,
        van_id: Ulid,
        stay: Stay,
        total_price: Amount,
    },
    BookingConfirmed {
        id: Ulid,
        van_id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        van_id: Ulid,
    },
    ChangeRequested {
        id: Ulid,
        booking_id: Ulid,
        van_id: Ulid,
        proposed: Stay,
        created_at: DateTime<Utc>,
    },
    /// Moves the booking and closes the request in one record.
    ChangeApproved {
        id: Ulid,
        booking_id: Ulid,
        van_id: Ulid,
        stay: Stay,
        total_price: Amount,
    },
    ChangeRejected {
        id: Ulid,
        van_id: Ulid,
    },
    CancellationRequested {
        id: Ulid,
        booking_id: Ulid,
        van_id: Ulid,
        created_at: DateTime<Utc>,
    },
    /// Cancels the booking and closes the request in one record.
    CancellationApproved {
        id: Ulid,
        booking_id: Ulid,
        van_id: Ulid,
    },
    CancellationRejected {
        id: Ulid,
        van_id: Ulid,
    },
}

impl Event {
    pub fn van_id(&self) -> Ulid {
        match self {
            Event::VanAdded { id, .. } | Event::VanRepriced { id, .. } => *id,
            Event::BookingCreated { van_id, .. }
            | Event::BookingRescheduled { van_id, .. }
            | Event::BookingConfirmed { van_id, .. }
            | Event::BookingCancelled { van_id, .. }
            | Event::ChangeRequested { van_id, .. }
            | Event::ChangeApproved { van_id, .. }
            | Event::ChangeRejected { van_id, .. }
            | Event::CancellationRequested { van_id, .. }
            | Event::CancellationApproved { van_id, .. }
            | Event::CancellationRejected { van_id, .. } => *van_id,
        }
    }

    /// The booking or request this event introduces, for the locator index.
    pub fn introduced_entity(&self) -> Option<Ulid> {
        match self {
            Event::BookingCreated { id, .. }
            | Event::ChangeRequested { id, .. }
            | Event::CancellationRequested { id, .. } => Some(*id),
            _ => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub van_id: Ulid,
    pub van_name: String,
    pub requester_id: Ulid,
    pub stay: Stay,
    pub total_price: Amount,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    /// A cancellation request is waiting for staff.
    pub cancellation_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequestInfo {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub van_id: Ulid,
    pub requester_id: Ulid,
    pub current: Stay,
    pub proposed: Stay,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationRequestInfo {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub van_id: Ulid,
    pub requester_id: Ulid,
    pub stay: Stay,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

/// What the payment session needs before the requester is sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutQuote {
    pub booking_id: Ulid,
    pub van_name: String,
    pub stay: Stay,
    pub amount: Amount,
}

/// Result of a payment-completion event. Every variant is a success for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Confirmed,
    AlreadyConfirmed,
    /// The booking was cancelled before the payment arrived.
    Ignored,
    UnknownBooking,
}

impl PaymentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOutcome::Confirmed => "confirmed",
            PaymentOutcome::AlreadyConfirmed => "already_confirmed",
            PaymentOutcome::Ignored => "ignored",
            PaymentOutcome::UnknownBooking => "unknown_booking",
        }
    }
}
