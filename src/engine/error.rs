use ulid::Ulid;

/// Every reason an engine operation can refuse. None of them leave a partial
/// mutation behind: validation happens before the WAL append.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── validation ───────────────────────────────────────
    #[error("InvalidDateFormat: {0:?} is not a YYYY-MM-DD date")]
    InvalidDateFormat(String),
    #[error("InvalidDateRange: end date must be after start date")]
    InvalidDateRange,
    #[error("DateInPast: stay must not start before {earliest}")]
    DateInPast { earliest: chrono::NaiveDate },
    #[error("Invalid: {0}")]
    Invalid(&'static str),

    // ── conflicts ────────────────────────────────────────
    #[error("NotAvailable: van is already booked for some of the selected dates")]
    NotAvailable,
    #[error("DuplicatePending: booking {0} already has a pending cancellation request")]
    DuplicatePending(Ulid),
    #[error("AlreadyExists: {0}")]
    AlreadyExists(Ulid),

    // ── state machine ────────────────────────────────────
    #[error("NotPending: {0} is not pending")]
    NotPending(Ulid),
    #[error("NotConfirmed: booking {0} is not confirmed")]
    NotConfirmed(Ulid),
    #[error("AlreadyCancelled: booking {0} is already cancelled")]
    AlreadyCancelled(Ulid),
    #[error("OngoingOrPast: booking {0} is ongoing or in the past")]
    OngoingOrPast(Ulid),
    #[error("RequiresApproval: confirmed booking {0} can only be cancelled through a cancellation request")]
    RequiresApproval(Ulid),

    // ── integrity ────────────────────────────────────────
    #[error("NotFound: {0}")]
    NotFound(Ulid),
    #[error("LimitExceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WalError: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable reason name for callers that render their own messages.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidDateFormat(_) => "InvalidDateFormat",
            EngineError::InvalidDateRange => "InvalidDateRange",
            EngineError::DateInPast { .. } => "DateInPast",
            EngineError::Invalid(_) => "Invalid",
            EngineError::NotAvailable => "NotAvailable",
            EngineError::DuplicatePending(_) => "DuplicatePending",
            EngineError::AlreadyExists(_) => "AlreadyExists",
            EngineError::NotPending(_) => "NotPending",
            EngineError::NotConfirmed(_) => "NotConfirmed",
            EngineError::AlreadyCancelled(_) => "AlreadyCancelled",
            EngineError::OngoingOrPast(_) => "OngoingOrPast",
            EngineError::RequiresApproval(_) => "RequiresApproval",
            EngineError::NotFound(_) => "NotFound",
            EngineError::LimitExceeded(_) => "LimitExceeded",
            EngineError::WalError(_) => "WalError",
        }
    }
}
