use chrono::{DateTime, NaiveDate, Utc};
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    OrganizerNotFound(Ulid),
    BookingNotFound(Ulid),
    /// Candidate starts before now + minimum_notice; carries the earliest
    /// bookable instant.
    InsufficientNotice { earliest: DateTime<Utc> },
    /// Candidate falls on an organizer-local blackout date.
    BlackoutDate(NaiveDate),
    /// No working-hours entry for the weekday, or the slot does not fit
    /// inside the configured range.
    OutsideWorkingHours,
    /// Advisory pre-commit overlap with the given confirmed booking.
    SlotConflict(Ulid),
    /// Authoritative commit-time rejection: a confirmed booking already
    /// holds this exact (organizer, start) key. Caller may re-query and retry.
    SlotAlreadyBooked(Ulid),
    /// Optimistic-lock mismatch on reschedule; carries the current version.
    ConcurrentModification { current_version: u32 },
    InvalidAction(&'static str),
    InvalidPolicy(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::OrganizerNotFound(id) => write!(f, "organizer not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::InsufficientNotice { earliest } => {
                write!(
                    f,
                    "insufficient notice: earliest bookable start is {}",
                    earliest.to_rfc3339()
                )
            }
            EngineError::BlackoutDate(date) => write!(f, "blackout date: {date}"),
            EngineError::OutsideWorkingHours => write!(f, "outside working hours"),
            EngineError::SlotConflict(id) => write!(f, "slot conflicts with booking: {id}"),
            EngineError::SlotAlreadyBooked(id) => {
                write!(f, "slot already booked by: {id}")
            }
            EngineError::ConcurrentModification { current_version } => {
                write!(
                    f,
                    "concurrent modification: booking is now at version {current_version}"
                )
            }
            EngineError::InvalidAction(msg) => write!(f, "invalid action: {msg}"),
            EngineError::InvalidPolicy(msg) => write!(f, "invalid policy: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
