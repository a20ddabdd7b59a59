mod error;
mod mutations;
mod queries;
mod slots;
mod validate;

pub use error::EngineError;
pub use slots::{generate_slots, WINDOW_DAYS};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedOrganizerState = Arc<RwLock<OrganizerState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes
    // do not leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedOrganizerState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → organizer id
    pub(super) booking_to_organizer: DashMap<Ulid, Ulid>,
    /// Time source. Swapped for a fixed clock in tests.
    pub(super) clock: Arc<dyn Clock>,
}

/// Apply an event directly to an OrganizerState (no locking — caller holds the lock).
fn apply_to_organizer(os: &mut OrganizerState, event: &Event, booking_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated {
            id,
            organizer_id,
            invitee_name,
            invitee_email,
            invitee_timezone,
            span,
        } => {
            os.insert_booking(Booking {
                id: *id,
                organizer_id: *organizer_id,
                invitee_name: invitee_name.clone(),
                invitee_email: invitee_email.clone(),
                invitee_timezone: invitee_timezone.clone(),
                span: *span,
                status: BookingStatus::Confirmed,
                version: 1,
            });
            booking_map.insert(*id, *organizer_id);
        }
        Event::BookingRescheduled { id, span, version, .. } => {
            os.reposition_booking(*id, *span, *version);
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(booking) = os.booking_mut(*id) {
                booking.status = BookingStatus::Cancelled;
            }
        }
        // PolicyConfigured is handled at the DashMap level, not here
        Event::PolicyConfigured { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        Self::with_clock(wal_path, notify, Arc::new(SystemClock))
    }

    pub fn with_clock(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_to_organizer: DashMap::new(),
            clock,
        };

        // Replay events — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use blocking_read/blocking_write
        // here because this may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::PolicyConfigured { organizer_id, policy } => {
                    if let Some(entry) = engine.state.get(organizer_id) {
                        let os_arc = entry.clone();
                        let mut guard = os_arc.try_write().expect("replay: uncontended write");
                        guard.policy = policy.clone();
                    } else {
                        let os = OrganizerState::new(*organizer_id, policy.clone());
                        engine.state.insert(*organizer_id, Arc::new(RwLock::new(os)));
                    }
                }
                other => {
                    if let Some(organizer_id) = event_organizer_id(other)
                        && let Some(entry) = engine.state.get(&organizer_id) {
                            let os_arc = entry.clone();
                            let mut guard = os_arc.try_write().expect("replay: uncontended write");
                            apply_to_organizer(&mut guard, other, &engine.booking_to_organizer);
                        }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_organizer(&self, id: &Ulid) -> Option<SharedOrganizerState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn organizer_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_organizer.get(booking_id).map(|e| *e.value())
    }

    pub(super) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        organizer_id: Ulid,
        os: &mut OrganizerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_organizer(os, event, &self.booking_to_organizer);
        self.notify.send(organizer_id, event);
        Ok(())
    }

    /// Lookup booking → organizer, get organizer, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<OrganizerState>), EngineError> {
        let organizer_id = self
            .organizer_for_booking(booking_id)
            .ok_or(EngineError::BookingNotFound(*booking_id))?;
        let os = self
            .get_organizer(&organizer_id)
            .ok_or(EngineError::OrganizerNotFound(organizer_id))?;
        let guard = os.write_owned().await;
        Ok((organizer_id, guard))
    }
}

/// Extract the organizer_id from an event (for non-PolicyConfigured events).
fn event_organizer_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated { organizer_id, .. }
        | Event::BookingRescheduled { organizer_id, .. }
        | Event::BookingCancelled { organizer_id, .. } => Some(*organizer_id),
        Event::PolicyConfigured { .. } => None,
    }
}
