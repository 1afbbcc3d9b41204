// Hard caps enforced by the engine. Exceeding one fails with `LimitExceeded`
// and mutates nothing.

pub const MAX_VANS: usize = 10_000;
pub const MAX_BOOKINGS_PER_VAN: usize = 50_000;
pub const MAX_REQUESTS_PER_VAN: usize = 50_000;
pub const MAX_NAME_LEN: usize = 200;

/// Longest single stay, in nights.
pub const MAX_STAY_NIGHTS: i64 = 365;

/// Highest nightly rate, in minor currency units. A full-length stay at this
/// rate must still fit in an `Amount`.
pub const MAX_DAILY_RATE: i64 = 1_000_000_000;
const _: () = assert!(MAX_DAILY_RATE.checked_mul(MAX_STAY_NIGHTS).is_some());

/// How far ahead of today a stay may start.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 730;

/// Widest window accepted by the free-window calendar query.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 1_096;

pub const MAX_WEBHOOK_BODY_BYTES: usize = 64 * 1024;
