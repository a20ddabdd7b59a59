use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open interval `[start, end)` of UTC instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Span {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn from_start(start: DateTime<Utc>, duration: Duration) -> Self {
        Self::new(start, start + duration)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[allow(dead_code)]
    pub fn contains_instant(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// One weekday's bookable range in the organizer's local wall clock.
/// At most one entry per weekday; `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// The organizer's configured rules. Replaced wholesale on update;
/// never applied retroactively to existing bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityPolicy {
    /// All wall-clock fields (working hours, blackout dates) are local to this zone.
    pub timezone: Tz,
    pub working_hours: Vec<WorkingHours>,
    /// Minutes per meeting, > 0.
    pub meeting_duration: u32,
    /// Minutes of padding required around every *booked* slot.
    pub buffer_before: u32,
    pub buffer_after: u32,
    /// Hours; no slot may start before now + minimum_notice.
    pub minimum_notice: u32,
    /// Organizer-local calendar dates fully excluded.
    pub blackout_dates: BTreeSet<NaiveDate>,
}

impl AvailabilityPolicy {
    pub fn hours_for(&self, weekday: Weekday) -> Option<&WorkingHours> {
        self.working_hours.iter().find(|wh| wh.weekday == weekday)
    }

    pub fn slot_duration(&self) -> Duration {
        Duration::minutes(self.meeting_duration as i64)
    }

    pub fn notice(&self) -> Duration {
        Duration::hours(self.minimum_notice as i64)
    }

    pub fn buffer_before(&self) -> Duration {
        Duration::minutes(self.buffer_before as i64)
    }

    pub fn buffer_after(&self) -> Duration {
        Duration::minutes(self.buffer_after as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

/// One confirmed or cancelled meeting. Never physically deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub organizer_id: Ulid,
    pub invitee_name: String,
    pub invitee_email: String,
    /// Invitee's zone, recorded for display only — validation always uses
    /// the organizer's policy timezone.
    pub invitee_timezone: String,
    /// Duration is baked in at creation; reschedule preserves it.
    pub span: Span,
    pub status: BookingStatus,
    /// Incremented on every successful reschedule; optimistic-lock guard.
    pub version: u32,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// An open slot offered to invitees, expressed in the caller's display zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSlot {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

#[derive(Debug, Clone)]
pub struct OrganizerState {
    pub id: Ulid,
    pub policy: AvailabilityPolicy,
    /// All bookings ever made (confirmed + cancelled), sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl OrganizerState {
    pub fn new(id: Ulid, policy: AvailabilityPolicy) -> Self {
        Self {
            id,
            policy,
            bookings: Vec::new(),
        }
    }

    /// Insert a booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Move a booking to a new span, keeping the vec sorted.
    pub fn reposition_booking(&mut self, id: Ulid, span: Span, version: u32) {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            let mut booking = self.bookings.remove(pos);
            booking.span = span;
            booking.version = version;
            self.insert_booking(booking);
        }
    }

    /// Confirmed bookings whose span overlaps the query window.
    /// Binary search skips bookings starting at or after `query.end`.
    pub fn confirmed_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.is_confirmed() && b.span.end > query.start)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// First configuration creates the organizer; later ones replace the
    /// policy wholesale.
    PolicyConfigured {
        organizer_id: Ulid,
        policy: AvailabilityPolicy,
    },
    BookingCreated {
        id: Ulid,
        organizer_id: Ulid,
        invitee_name: String,
        invitee_email: String,
        invitee_timezone: String,
        span: Span,
    },
    BookingRescheduled {
        id: Ulid,
        organizer_id: Ulid,
        span: Span,
        version: u32,
    },
    BookingCancelled {
        id: Ulid,
        organizer_id: Ulid,
    },
}
