use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::slots::generate_slots;
use super::{Engine, EngineError, SharedOrganizerState};

impl Engine {
    /// Open slots for the next window, rendered in `display_tz`.
    pub async fn available_slots(
        &self,
        organizer_id: Ulid,
        display_tz: Tz,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let os = self
            .get_organizer(&organizer_id)
            .ok_or(EngineError::OrganizerNotFound(organizer_id))?;
        let guard = os.read().await;
        Ok(generate_slots(&guard, self.now(), display_tz))
    }

    /// Bookings for an organizer ordered by start time, optionally filtered
    /// by status and paginated.
    pub async fn list_bookings(
        &self,
        organizer_id: Ulid,
        status: Option<BookingStatus>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Booking>, EngineError> {
        let os = self
            .get_organizer(&organizer_id)
            .ok_or(EngineError::OrganizerNotFound(organizer_id))?;
        let guard = os.read().await;
        let limit = limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);
        Ok(guard
            .bookings
            .iter()
            .filter(|b| status.is_none_or(|s| b.status == s))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    pub async fn get_policy(&self, organizer_id: Ulid) -> Result<AvailabilityPolicy, EngineError> {
        let os = self
            .get_organizer(&organizer_id)
            .ok_or(EngineError::OrganizerNotFound(organizer_id))?;
        let guard = os.read().await;
        Ok(guard.policy.clone())
    }

    pub async fn list_policies(&self) -> Vec<(Ulid, AvailabilityPolicy)> {
        // Snapshot the Arcs first; never hold a DashMap shard lock across an await.
        let organizers: Vec<SharedOrganizerState> =
            self.state.iter().map(|entry| entry.value().clone()).collect();
        let mut policies = Vec::with_capacity(organizers.len());
        for os in organizers {
            let guard = os.read().await;
            policies.push((guard.id, guard.policy.clone()));
        }
        policies
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let organizer_id = self
            .organizer_for_booking(&id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let os = self
            .get_organizer(&organizer_id)
            .ok_or(EngineError::OrganizerNotFound(organizer_id))?;
        let guard = os.read().await;
        guard
            .booking(id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(id))
    }
}
