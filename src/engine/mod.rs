mod availability;
mod conflict;
mod lifecycle;
mod mutations;
mod queries;

pub use availability::{AvailabilityQuery, available_dates, available_shifts, reserved_shift_ids};
pub use lifecycle::{Authority, TRANSITIONS, apply_transition, check_transition};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, Entry};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::error::BookingError;
use crate::model::*;
use crate::wal::Wal;

pub type SharedShiftState = Arc<RwLock<ShiftState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped: all senders dropped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// Authoritative store for one studio: profiles, subjects, shifts and reservations.
///
/// Each shift sits behind its own lock; every reservation write for that shift
/// happens while holding it, which is what makes "one active reservation per
/// shift" a hard constraint rather than a best-effort check.
pub struct Engine {
    profiles: DashMap<Ulid, Profile>,
    subjects: DashMap<Ulid, Subject>,
    shifts: DashMap<Ulid, SharedShiftState>,
    reservations: DashMap<Ulid, Reservation>,
    /// Teacher → owned shift ids, for the overlap check.
    teacher_shifts: DashMap<Ulid, Vec<Ulid>>,
    /// Serialises shift creation per teacher.
    teacher_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Serialises profile registration so emails stay unique.
    registry: Mutex<()>,
    /// Ids of subjects, shifts and reservations between their uniqueness
    /// check and their commit.
    id_claims: DashMap<Ulid, ()>,
    /// Mutations hold it shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss a concurrent commit. Always taken
    /// before any teacher or shift lock.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

/// Released on drop, committed or not.
struct IdClaim<'a> {
    claims: &'a DashMap<Ulid, ()>,
    id: Ulid,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.id);
    }
}

/// Apply a shift-scoped event. Caller holds the shift's write lock.
fn apply_to_shift(ss: &mut ShiftState, event: &Event) {
    match event {
        Event::ShiftUpdated { shift } => ss.shift = shift.clone(),
        Event::ShiftDeleted { .. } => ss.retired = true,
        Event::ReservationCreated { reservation } => {
            ss.reservation_ids.push(reservation.id);
            if reservation.is_active() {
                ss.active = Some(reservation.id);
            }
        }
        Event::ReservationUpdated { reservation } => {
            if reservation.is_active() {
                ss.active = Some(reservation.id);
            } else if ss.active == Some(reservation.id) {
                ss.active = None;
            }
        }
        Event::ProfileRegistered { .. }
        | Event::ProfileVerified { .. }
        | Event::SubjectCreated { .. }
        | Event::ShiftCreated { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            profiles: DashMap::new(),
            subjects: DashMap::new(),
            shifts: DashMap::new(),
            reservations: DashMap::new(),
            teacher_shifts: DashMap::new(),
            teacher_locks: DashMap::new(),
            registry: Mutex::new(()),
            id_claims: DashMap::new(),
            commit_gate: RwLock::new(()),
            wal_tx,
        };

        // Sole owner of every lock during replay, so try_write never contends.
        // Blocking lock calls are off limits: this can run inside the runtime.
        for event in &events {
            if let Some(shift_id) = event.shift_id()
                && let Some(state) = engine.get_shift(&shift_id)
                && let Ok(mut guard) = state.try_write()
            {
                apply_to_shift(&mut guard, event);
            }
            engine.apply_tables(event);
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events from {}: {} shifts, {} reservations",
                events.len(),
                wal_path.display(),
                engine.shifts.len(),
                engine.reservations.len()
            );
        }

        Ok(engine)
    }

    /// Collection-level bookkeeping for an event.
    fn apply_tables(&self, event: &Event) {
        match event {
            Event::ProfileRegistered { profile } => {
                self.profiles.insert(profile.id, profile.clone());
            }
            Event::ProfileVerified { id, at } => {
                if let Some(mut profile) = self.profiles.get_mut(id) {
                    profile.verified_at = Some(*at);
                    profile.updated_at = *at;
                }
            }
            Event::SubjectCreated { subject } => {
                self.subjects.insert(subject.id, subject.clone());
            }
            Event::ShiftCreated { shift } => {
                let state = ShiftState::new(shift.clone());
                self.shifts.insert(shift.id, Arc::new(RwLock::new(state)));
                self.teacher_shifts
                    .entry(shift.teacher_id)
                    .or_default()
                    .push(shift.id);
            }
            Event::ShiftUpdated { .. } => {}
            Event::ShiftDeleted { id, teacher_id } => {
                self.shifts.remove(id);
                if let Some(mut owned) = self.teacher_shifts.get_mut(teacher_id) {
                    owned.retain(|s| s != id);
                }
            }
            Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
                self.reservations.insert(reservation.id, reservation.clone());
            }
        }
    }

    /// Hand the event to the group-commit writer and wait for its fsync.
    async fn wal_append(&self, event: &Event) -> Result<(), BookingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| BookingError::RemoteUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::RemoteUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::Storage(e.to_string()))
    }

    /// WAL-append, then apply to the locked shift (if any) and the collections.
    async fn persist_and_apply(
        &self,
        shift: Option<&mut ShiftState>,
        event: &Event,
    ) -> Result<(), BookingError> {
        self.wal_append(event).await?;
        if let Some(ss) = shift {
            apply_to_shift(ss, event);
        }
        self.apply_tables(event);
        Ok(())
    }

    /// Reserve `id` for a row about to be committed to `table`. The claim
    /// must outlive `persist_and_apply` so a racing insert sees either the
    /// claim or the row.
    fn claim_id<'a, T>(&'a self, table: &DashMap<Ulid, T>, id: Ulid) -> Result<IdClaim<'a>, BookingError> {
        match self.id_claims.entry(id) {
            Entry::Occupied(_) => return Err(BookingError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        let claim = IdClaim { claims: &self.id_claims, id };
        if table.contains_key(&id) {
            return Err(BookingError::AlreadyExists(id));
        }
        Ok(claim)
    }

    pub fn get_shift(&self, id: &Ulid) -> Option<SharedShiftState> {
        self.shifts.get(id).map(|e| e.value().clone())
    }

    fn teacher_lock(&self, teacher_id: Ulid) -> Arc<Mutex<()>> {
        self.teacher_locks.entry(teacher_id).or_default().clone()
    }
}
