use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::*;

use super::validate::find_conflict;

/// Slots are offered over a rolling window of this many days from "now",
/// anchored in the organizer's timezone.
pub const WINDOW_DAYS: i64 = 14;

/// Enumerate open slots for an organizer: pure, stateless, deterministic
/// for a fixed `now`.
///
/// One organizer-local calendar day at a time: blackout days and days
/// without a working-hours entry are skipped; within a day, candidates
/// step forward from the configured start in `meeting_duration` increments
/// and a trailing partial slot is never offered. Candidates are dropped
/// when they start before `now + minimum_notice` or overlap a confirmed
/// booking padded by `[start − buffer_before, end + buffer_after)`.
/// Survivors come out chronologically, converted to `display_tz`.
pub fn generate_slots(state: &OrganizerState, now: DateTime<Utc>, display_tz: Tz) -> Vec<TimeSlot> {
    let policy = &state.policy;
    let duration = policy.slot_duration();
    let earliest = now + policy.notice();
    let window_end = now + Duration::days(WINDOW_DAYS);

    let mut slots = Vec::new();
    let mut day = now.with_timezone(&policy.timezone).date_naive();
    let last_day = window_end.with_timezone(&policy.timezone).date_naive();

    while day <= last_day {
        if policy.blackout_dates.contains(&day) {
            day += Duration::days(1);
            continue;
        }
        let Some(hours) = policy.hours_for(day.weekday()) else {
            day += Duration::days(1);
            continue;
        };

        let day_end = day.and_time(hours.end);
        let mut cursor = day.and_time(hours.start);
        while cursor + duration <= day_end {
            // Local wall times erased by a DST gap resolve to no instant and
            // contribute no candidate.
            if let Some(local_start) = policy.timezone.from_local_datetime(&cursor).earliest() {
                let start = local_start.with_timezone(&Utc);
                let span = Span::from_start(start, duration);
                if start >= now
                    && start < window_end
                    && start >= earliest
                    && find_conflict(policy, state, &span, None).is_none()
                {
                    slots.push(TimeSlot {
                        start: start.with_timezone(&display_tz),
                        end: span.end.with_timezone(&display_tz),
                    });
                }
            }
            cursor += duration;
        }
        day += Duration::days(1);
    }

    slots
}
