use chrono::{DateTime, Datelike, Utc};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Candidate start must be at or after now + minimum_notice.
/// The boundary itself is bookable.
pub(crate) fn check_notice(
    policy: &AvailabilityPolicy,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let earliest = now + policy.notice();
    if start < earliest {
        return Err(EngineError::InsufficientNotice { earliest });
    }
    Ok(())
}

/// The candidate's organizer-local calendar date must not be blacked out.
pub(crate) fn check_blackout(
    policy: &AvailabilityPolicy,
    start: DateTime<Utc>,
) -> Result<(), EngineError> {
    let local_date = start.with_timezone(&policy.timezone).date_naive();
    if policy.blackout_dates.contains(&local_date) {
        return Err(EngineError::BlackoutDate(local_date));
    }
    Ok(())
}

/// The whole `[start, start + duration)` range must fit inside the
/// working-hours entry for the candidate's organizer-local weekday.
pub(crate) fn check_working_hours(
    policy: &AvailabilityPolicy,
    span: &Span,
) -> Result<(), EngineError> {
    let local_start = span.start.with_timezone(&policy.timezone).naive_local();
    let hours = policy
        .hours_for(local_start.weekday())
        .ok_or(EngineError::OutsideWorkingHours)?;

    let day = local_start.date();
    let day_start = day.and_time(hours.start);
    let day_end = day.and_time(hours.end);
    // Compare in local wall-clock terms; a slot crossing midnight can never
    // fit since day_end is on the same date.
    let local_end = local_start + span.duration();
    if local_start < day_start || local_end > day_end {
        return Err(EngineError::OutsideWorkingHours);
    }
    Ok(())
}

/// Find a confirmed booking whose buffer-expanded span overlaps the candidate.
/// Stored bookings are expanded by `[start − buffer_before, end + buffer_after)`;
/// the candidate itself is never expanded. `exclude` skips the booking being
/// rescheduled.
pub(crate) fn find_conflict<'a>(
    policy: &AvailabilityPolicy,
    state: &'a OrganizerState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    // Widen the scan window so bookings whose padding reaches into the
    // candidate are not skipped by the binary search.
    let query = Span::new(
        span.start - policy.buffer_after(),
        span.end + policy.buffer_before(),
    );
    for booking in state.confirmed_overlapping(&query) {
        if exclude == Some(booking.id) {
            continue;
        }
        let padded = Span::new(
            booking.span.start - policy.buffer_before(),
            booking.span.end + policy.buffer_after(),
        );
        if padded.overlaps(span) {
            return Some(booking);
        }
    }
    None
}

/// Map a conflicting stored booking onto the caller-visible error: an exact
/// start-time collision is the slot being taken outright, anything else is a
/// plain overlap.
pub(crate) fn conflict_error(candidate: &Span, other: &Booking) -> EngineError {
    if other.span.start == candidate.start {
        EngineError::SlotAlreadyBooked(other.id)
    } else {
        EngineError::SlotConflict(other.id)
    }
}

/// The single source of truth for "can this candidate start be booked",
/// shared by booking creation, reschedule, and (as its exclusion test)
/// the slot generator. Checks run in a fixed order; the first failure
/// determines the reported reason.
pub fn validate_candidate(
    state: &OrganizerState,
    start: DateTime<Utc>,
    duration: chrono::Duration,
    now: DateTime<Utc>,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let policy = &state.policy;
    check_notice(policy, start, now)?;
    check_blackout(policy, start)?;
    let span = Span::from_start(start, duration);
    check_working_hours(policy, &span)?;
    if let Some(conflicting) = find_conflict(policy, state, &span, exclude) {
        return Err(conflict_error(&span, conflicting));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Weekday};
    use std::collections::BTreeSet;

    fn policy_utc() -> AvailabilityPolicy {
        // Mon-Sun 09:00-17:00 so weekday choice doesn't matter unless a test
        // removes entries.
        let working_hours = [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .map(|weekday| WorkingHours {
            weekday,
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        })
        .collect();
        AvailabilityPolicy {
            timezone: chrono_tz::UTC,
            working_hours,
            meeting_duration: 30,
            buffer_before: 0,
            buffer_after: 0,
            minimum_notice: 0,
            blackout_dates: BTreeSet::new(),
        }
    }

    fn state_with(policy: AvailabilityPolicy, bookings: Vec<(Ulid, Span)>) -> OrganizerState {
        let mut state = OrganizerState::new(Ulid::new(), policy);
        for (id, span) in bookings {
            state.insert_booking(Booking {
                id,
                organizer_id: state.id,
                invitee_name: "Ada".into(),
                invitee_email: "ada@example.com".into(),
                invitee_timezone: "UTC".into(),
                span,
                status: BookingStatus::Confirmed,
                version: 1,
            });
        }
        state
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn dur30() -> chrono::Duration {
        chrono::Duration::minutes(30)
    }

    #[test]
    fn minimum_notice_boundary() {
        let mut policy = policy_utc();
        policy.minimum_notice = 24;
        let state = state_with(policy, vec![]);
        let now = utc(2025, 11, 15, 10, 0);

        // One minute short of 24h notice
        let result = validate_candidate(&state, utc(2025, 11, 16, 9, 59), dur30(), now, None);
        assert!(matches!(
            result,
            Err(EngineError::InsufficientNotice { .. })
        ));

        // Exactly 24h out — the boundary is bookable
        validate_candidate(&state, utc(2025, 11, 16, 10, 0), dur30(), now, None).unwrap();
    }

    #[test]
    fn blackout_date_rejected() {
        let mut policy = policy_utc();
        policy
            .blackout_dates
            .insert(chrono::NaiveDate::from_ymd_opt(2025, 11, 17).unwrap());
        let state = state_with(policy, vec![]);
        let now = utc(2025, 11, 15, 8, 0);

        let result = validate_candidate(&state, utc(2025, 11, 17, 10, 0), dur30(), now, None);
        assert_eq!(
            result,
            Err(EngineError::BlackoutDate(
                chrono::NaiveDate::from_ymd_opt(2025, 11, 17).unwrap()
            ))
        );
    }

    #[test]
    fn no_working_hours_entry_rejected() {
        let mut policy = policy_utc();
        // 2025-11-16 is a Sunday
        policy.working_hours.retain(|wh| wh.weekday != Weekday::Sun);
        let state = state_with(policy, vec![]);
        let now = utc(2025, 11, 15, 8, 0);

        let result = validate_candidate(&state, utc(2025, 11, 16, 10, 0), dur30(), now, None);
        assert_eq!(result, Err(EngineError::OutsideWorkingHours));
    }

    #[test]
    fn slot_must_fit_inside_working_hours() {
        let state = state_with(policy_utc(), vec![]);
        let now = utc(2025, 11, 15, 8, 0);

        // Before opening
        assert_eq!(
            validate_candidate(&state, utc(2025, 11, 17, 8, 45), dur30(), now, None),
            Err(EngineError::OutsideWorkingHours)
        );
        // Trailing slot would end past 17:00
        assert_eq!(
            validate_candidate(&state, utc(2025, 11, 17, 16, 45), dur30(), now, None),
            Err(EngineError::OutsideWorkingHours)
        );
        // Last fitting slot
        validate_candidate(&state, utc(2025, 11, 17, 16, 30), dur30(), now, None).unwrap();
        // Off-grid but inside hours is fine — the validator does not enforce
        // grid alignment
        validate_candidate(&state, utc(2025, 11, 17, 10, 17), dur30(), now, None).unwrap();
    }

    #[test]
    fn working_hours_use_policy_timezone() {
        let mut policy = policy_utc();
        policy.timezone = chrono_tz::America::New_York;
        let state = state_with(policy, vec![]);
        let now = utc(2025, 11, 15, 8, 0);

        // 14:00 UTC on 2025-11-17 is 09:00 in New York (EST) — bookable
        validate_candidate(&state, utc(2025, 11, 17, 14, 0), dur30(), now, None).unwrap();
        // 13:30 UTC is 08:30 local — too early
        assert_eq!(
            validate_candidate(&state, utc(2025, 11, 17, 13, 30), dur30(), now, None),
            Err(EngineError::OutsideWorkingHours)
        );
    }

    #[test]
    fn overlap_is_a_conflict() {
        let existing = Ulid::new();
        let state = state_with(
            policy_utc(),
            vec![(
                existing,
                Span::new(utc(2025, 11, 17, 14, 0), utc(2025, 11, 17, 14, 30)),
            )],
        );
        let now = utc(2025, 11, 15, 8, 0);

        let result = validate_candidate(&state, utc(2025, 11, 17, 14, 15), dur30(), now, None);
        assert_eq!(result, Err(EngineError::SlotConflict(existing)));

        // Adjacent (no buffers) is fine
        validate_candidate(&state, utc(2025, 11, 17, 14, 30), dur30(), now, None).unwrap();
    }

    #[test]
    fn buffers_pad_stored_bookings_only() {
        let mut policy = policy_utc();
        policy.buffer_before = 5;
        policy.buffer_after = 10;
        let existing = Ulid::new();
        let state = state_with(
            policy,
            vec![(
                existing,
                Span::new(utc(2025, 11, 17, 14, 0), utc(2025, 11, 17, 14, 30)),
            )],
        );
        let now = utc(2025, 11, 15, 8, 0);

        // Ends at 14:20, inside the padded zone [13:55, 14:40)
        assert_eq!(
            validate_candidate(&state, utc(2025, 11, 17, 13, 50), dur30(), now, None),
            Err(EngineError::SlotConflict(existing))
        );
        // Starts at 14:20, still inside the padded zone
        assert_eq!(
            validate_candidate(&state, utc(2025, 11, 17, 14, 20), dur30(), now, None),
            Err(EngineError::SlotConflict(existing))
        );
        // Ends exactly at the padded start — clear
        validate_candidate(&state, utc(2025, 11, 17, 13, 25), dur30(), now, None).unwrap();
        // Starts exactly at the padded end — clear
        validate_candidate(&state, utc(2025, 11, 17, 14, 40), dur30(), now, None).unwrap();
    }

    #[test]
    fn exclude_skips_own_booking_on_reschedule() {
        let own = Ulid::new();
        let state = state_with(
            policy_utc(),
            vec![(
                own,
                Span::new(utc(2025, 11, 17, 14, 0), utc(2025, 11, 17, 14, 30)),
            )],
        );
        let now = utc(2025, 11, 15, 8, 0);

        // Moving within its own current span conflicts without the exclusion...
        assert_eq!(
            validate_candidate(&state, utc(2025, 11, 17, 14, 15), dur30(), now, None),
            Err(EngineError::SlotConflict(own))
        );
        // ...and is clean with it.
        validate_candidate(&state, utc(2025, 11, 17, 14, 15), dur30(), now, Some(own)).unwrap();
    }

    #[test]
    fn cancelled_bookings_do_not_conflict() {
        let cancelled = Ulid::new();
        let mut state = state_with(
            policy_utc(),
            vec![(
                cancelled,
                Span::new(utc(2025, 11, 17, 14, 0), utc(2025, 11, 17, 14, 30)),
            )],
        );
        state.booking_mut(cancelled).unwrap().status = BookingStatus::Cancelled;
        let now = utc(2025, 11, 15, 8, 0);

        validate_candidate(&state, utc(2025, 11, 17, 14, 0), dur30(), now, None).unwrap();
    }

    #[test]
    fn check_order_notice_before_blackout() {
        // A candidate violating several constraints reports the first check's
        // reason.
        let mut policy = policy_utc();
        policy.minimum_notice = 48;
        policy
            .blackout_dates
            .insert(chrono::NaiveDate::from_ymd_opt(2025, 11, 16).unwrap());
        let state = state_with(policy, vec![]);
        let now = utc(2025, 11, 15, 10, 0);

        let result = validate_candidate(&state, utc(2025, 11, 16, 10, 0), dur30(), now, None);
        assert!(matches!(
            result,
            Err(EngineError::InsufficientNotice { .. })
        ));
    }
}
