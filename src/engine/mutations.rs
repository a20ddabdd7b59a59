use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::validate_candidate;
use super::{Engine, EngineError, WalCommand};

fn validate_policy(policy: &AvailabilityPolicy) -> Result<(), EngineError> {
    if policy.meeting_duration == 0 {
        return Err(EngineError::InvalidPolicy("meeting_duration must be positive".into()));
    }
    if policy.meeting_duration > MINUTES_PER_DAY {
        return Err(EngineError::InvalidPolicy("meeting_duration exceeds one day".into()));
    }
    if policy.buffer_before > MINUTES_PER_DAY || policy.buffer_after > MINUTES_PER_DAY {
        return Err(EngineError::InvalidPolicy("buffer exceeds one day".into()));
    }
    if policy.blackout_dates.len() > MAX_BLACKOUT_DATES {
        return Err(EngineError::LimitExceeded("too many blackout dates"));
    }
    let mut seen = [false; 7];
    for wh in &policy.working_hours {
        let idx = wh.weekday.num_days_from_monday() as usize;
        if seen[idx] {
            return Err(EngineError::InvalidPolicy(format!(
                "duplicate working-hours entry for {:?}",
                wh.weekday
            )));
        }
        seen[idx] = true;
        if wh.start >= wh.end {
            return Err(EngineError::InvalidPolicy(format!(
                "working hours start must precede end on {:?}",
                wh.weekday
            )));
        }
    }
    Ok(())
}

fn check_start_in_range(start: DateTime<Utc>) -> Result<(), EngineError> {
    let year = start.year();
    if !(MIN_VALID_YEAR..=MAX_VALID_YEAR).contains(&year) {
        return Err(EngineError::InvalidAction("start time out of supported range"));
    }
    Ok(())
}

impl Engine {
    /// Create an organizer's policy, or wholesale-replace an existing one.
    /// Existing bookings are untouched: policy changes are never retroactive.
    pub async fn configure_policy(
        &self,
        organizer_id: Ulid,
        policy: AvailabilityPolicy,
    ) -> Result<(), EngineError> {
        validate_policy(&policy)?;

        if let Some(os) = self.get_organizer(&organizer_id) {
            let mut guard = os.write().await;
            let event = Event::PolicyConfigured { organizer_id, policy: policy.clone() };
            self.wal_append(&event).await?;
            guard.policy = policy;
            self.notify.send(organizer_id, &event);
            return Ok(());
        }

        if self.state.len() >= MAX_ORGANIZERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many organizers"));
        }
        let event = Event::PolicyConfigured { organizer_id, policy: policy.clone() };
        self.wal_append(&event).await?;
        let os = OrganizerState::new(organizer_id, policy);
        self.state.insert(organizer_id, Arc::new(RwLock::new(os)));
        self.notify.send(organizer_id, &event);
        Ok(())
    }

    /// Commit a booking at `start`. Validation and insertion happen under the
    /// organizer's write lock, so of two racing requests for the same slot
    /// exactly one commits and the other sees the winner's booking.
    pub async fn create_booking(
        &self,
        id: Ulid,
        organizer_id: Ulid,
        invitee_name: String,
        invitee_email: String,
        invitee_timezone: String,
        start: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if invitee_name.is_empty() || invitee_name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("invitee name length"));
        }
        if invitee_email.is_empty() || invitee_email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("invitee email length"));
        }
        if invitee_timezone.len() > MAX_TIMEZONE_LEN {
            return Err(EngineError::LimitExceeded("invitee timezone length"));
        }
        if invitee_timezone.parse::<Tz>().is_err() {
            return Err(EngineError::InvalidAction("unknown invitee timezone"));
        }
        check_start_in_range(start)?;

        let os = self
            .get_organizer(&organizer_id)
            .ok_or(EngineError::OrganizerNotFound(organizer_id))?;
        let mut guard = os.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ORGANIZER {
            return Err(EngineError::LimitExceeded("too many bookings for organizer"));
        }

        let duration = guard.policy.slot_duration();
        validate_candidate(&guard, start, duration, self.now(), None)?;
        let span = Span::from_start(start, duration);

        let event = Event::BookingCreated {
            id,
            organizer_id,
            invitee_name,
            invitee_email,
            invitee_timezone,
            span,
        };
        self.persist_and_apply(organizer_id, &mut guard, &event).await
    }

    /// Move a confirmed booking to `new_start`, keeping the duration it was
    /// booked with. `expected_version` is the optimistic-concurrency token:
    /// a stale version fails without touching state.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        new_start: DateTime<Utc>,
        expected_version: u32,
    ) -> Result<Ulid, EngineError> {
        check_start_in_range(new_start)?;
        let (organizer_id, mut guard) = self.resolve_booking_write(&id).await?;

        let booking = guard.booking(id).ok_or(EngineError::BookingNotFound(id))?;
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::InvalidAction("cannot reschedule a cancelled booking"));
        }
        if booking.version != expected_version {
            return Err(EngineError::ConcurrentModification {
                current_version: booking.version,
            });
        }
        let duration = booking.span.duration();
        let next_version = booking.version + 1;

        validate_candidate(&guard, new_start, duration, self.now(), Some(id))?;
        let span = Span::from_start(new_start, duration);

        let event = Event::BookingRescheduled { id, organizer_id, span, version: next_version };
        self.persist_and_apply(organizer_id, &mut guard, &event).await?;
        Ok(organizer_id)
    }

    /// Cancel a booking, freeing its slot. Cancelling an already-cancelled
    /// booking is a no-op and appends nothing to the WAL.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (organizer_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::BookingNotFound(id))?;
        if booking.status == BookingStatus::Cancelled {
            return Ok(organizer_id);
        }

        let event = Event::BookingCancelled { id, organizer_id };
        self.persist_and_apply(organizer_id, &mut guard, &event).await?;
        Ok(organizer_id)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        // Snapshot the Arcs first; never hold a DashMap shard lock across an await.
        let organizers: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for os in organizers {
            let guard = os.read().await;

            events.push(Event::PolicyConfigured {
                organizer_id: guard.id,
                policy: guard.policy.clone(),
            });
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: booking.id,
                    organizer_id: guard.id,
                    invitee_name: booking.invitee_name.clone(),
                    invitee_email: booking.invitee_email.clone(),
                    invitee_timezone: booking.invitee_timezone.clone(),
                    span: booking.span,
                });
                if booking.version > 1 {
                    events.push(Event::BookingRescheduled {
                        id: booking.id,
                        organizer_id: guard.id,
                        span: booking.span,
                        version: booking.version,
                    });
                }
                if booking.status == BookingStatus::Cancelled {
                    events.push(Event::BookingCancelled {
                        id: booking.id,
                        organizer_id: guard.id,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
