use std::collections::BTreeSet;

use chrono::NaiveDate;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::error::BookingError;
use crate::limits::*;
use crate::model::*;

use super::conflict::*;
use super::lifecycle::{apply_transition, check_transition};
use super::{Engine, WalCommand};

impl Engine {
    // ── Profiles and subjects ────────────────────────────

    pub async fn register_profile(
        &self,
        actor: &Principal,
        new: NewProfile,
    ) -> Result<Profile, BookingError> {
        if !actor.is_admin() {
            return Err(BookingError::Unauthorized("only an admin can register profiles"));
        }
        validate_email(&new.email)?;
        validate_name(&new.name)?;

        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        if self.profiles.len() >= MAX_PROFILES_PER_STUDIO {
            return Err(BookingError::LimitExceeded("too many profiles"));
        }
        if self.profiles.contains_key(&new.id) {
            return Err(BookingError::AlreadyExists(new.id));
        }
        if let Some(existing) = self.find_profile_by_email(&new.email) {
            return Err(BookingError::AlreadyExists(existing.id));
        }

        let now = now();
        let profile = Profile {
            id: new.id,
            email: new.email,
            name: new.name,
            role: new.role,
            verified_at: None,
            created_at: now,
            updated_at: now,
        };
        let event = Event::ProfileRegistered { profile: profile.clone() };
        self.persist_and_apply(None, &event).await?;
        Ok(profile)
    }

    /// Record email confirmation. Verifying twice is a no-op.
    pub async fn verify_profile(&self, actor: &Principal, id: Ulid) -> Result<Profile, BookingError> {
        if !actor.is_admin() {
            return Err(BookingError::Unauthorized("only an admin can verify profiles"));
        }
        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        let profile = self
            .get_profile(&id)
            .ok_or_else(|| BookingError::ProfileNotFound(id.to_string()))?;
        if profile.is_verified() {
            return Ok(profile);
        }

        let event = Event::ProfileVerified { id, at: now() };
        self.persist_and_apply(None, &event).await?;
        self.get_profile(&id)
            .ok_or_else(|| BookingError::ProfileNotFound(id.to_string()))
    }

    pub async fn create_subject(
        &self,
        actor: &Principal,
        id: Ulid,
        name: String,
    ) -> Result<Subject, BookingError> {
        if actor.role == Role::Student {
            return Err(BookingError::Unauthorized("students cannot create subjects"));
        }
        validate_name(&name)?;

        let _gate = self.commit_gate.read().await;
        if self.subjects.len() >= MAX_SUBJECTS_PER_STUDIO {
            return Err(BookingError::LimitExceeded("too many subjects"));
        }
        let _claim = self.claim_id(&self.subjects, id)?;

        let subject = Subject { id, name, created_at: now() };
        let event = Event::SubjectCreated { subject: subject.clone() };
        self.persist_and_apply(None, &event).await?;
        Ok(subject)
    }

    // ── Shifts ───────────────────────────────────────────

    pub async fn create_shift(&self, actor: &Principal, new: NewShift) -> Result<Shift, BookingError> {
        self.authorize_shift_creation(actor, &new.teacher_id)?;
        let span = validate_span(new.start_time, new.end_time)?;
        self.validate_subject_set(&new.subject_ids)?;

        let _gate = self.commit_gate.read().await;
        if self.shifts.len() >= MAX_SHIFTS_PER_STUDIO {
            return Err(BookingError::LimitExceeded("too many shifts"));
        }
        let _claim = self.claim_id(&self.shifts, new.id)?;

        let lock = self.teacher_lock(new.teacher_id);
        let _serial = lock.lock().await;
        let same_day = self.teacher_spans_on(new.teacher_id, new.date).await;
        check_no_overlap(&span, same_day)?;

        let now = now();
        let shift = Shift {
            id: new.id,
            teacher_id: new.teacher_id,
            date: new.date,
            start_time: new.start_time,
            end_time: new.end_time,
            subject_ids: new.subject_ids,
            created_at: now,
            updated_at: now,
        };
        let event = Event::ShiftCreated { shift: shift.clone() };
        self.persist_and_apply(None, &event).await?;
        Ok(shift)
    }

    /// Edit a shift's date, times or subjects. The overlap check is not
    /// repeated here, so an edit can leave two of a teacher's shifts overlapping.
    pub async fn update_shift(
        &self,
        actor: &Principal,
        id: Ulid,
        changes: ShiftChanges,
    ) -> Result<Shift, BookingError> {
        let _gate = self.commit_gate.read().await;
        let state = self.get_shift(&id).ok_or(BookingError::ShiftNotFound(id))?;
        let mut guard = state.write().await;
        if guard.retired {
            return Err(BookingError::ShiftNotFound(id));
        }
        authorize_shift_owner(actor, &guard.shift.teacher_id)?;

        // Merged under the write lock so columns left out of the edit keep
        // whatever a concurrent edit committed.
        let current = &guard.shift;
        let shift = Shift {
            date: changes.date.unwrap_or(current.date),
            start_time: changes.start_time.unwrap_or(current.start_time),
            end_time: changes.end_time.unwrap_or(current.end_time),
            subject_ids: changes.subject_ids.unwrap_or_else(|| current.subject_ids.clone()),
            updated_at: now(),
            ..current.clone()
        };
        validate_span(shift.start_time, shift.end_time)?;
        self.validate_subject_set(&shift.subject_ids)?;

        let event = Event::ShiftUpdated { shift: shift.clone() };
        self.persist_and_apply(Some(&mut *guard), &event).await?;
        Ok(shift)
    }

    /// Remove a shift with no active reservation. Its cancelled reservations stay.
    pub async fn delete_shift(&self, actor: &Principal, id: Ulid) -> Result<(), BookingError> {
        let _gate = self.commit_gate.read().await;
        let state = self.get_shift(&id).ok_or(BookingError::ShiftNotFound(id))?;
        let mut guard = state.write().await;
        if guard.retired {
            return Err(BookingError::ShiftNotFound(id));
        }
        authorize_shift_owner(actor, &guard.shift.teacher_id)?;
        check_deletable(&guard)?;

        let event = Event::ShiftDeleted {
            id,
            teacher_id: guard.shift.teacher_id,
        };
        self.persist_and_apply(Some(&mut *guard), &event).await
    }

    // ── Reservations ─────────────────────────────────────

    /// Reserve a shift for one of its subjects.
    ///
    /// Checks run in a fixed order under the shift's write lock: the shift
    /// exists, it offers the subject, it has no active reservation. The new
    /// reservation is `confirmed` and snapshots the shift's date and times.
    pub async fn create_reservation(
        &self,
        actor: &Principal,
        new: NewReservation,
    ) -> Result<Reservation, BookingError> {
        if !actor.is_student(&new.student_id) {
            return Err(BookingError::Unauthorized("students reserve for themselves only"));
        }
        validate_notes(&new.notes)?;

        let _gate = self.commit_gate.read().await;
        if self.reservations.len() >= MAX_RESERVATIONS_PER_STUDIO {
            return Err(BookingError::LimitExceeded("too many reservations"));
        }
        let _claim = self.claim_id(&self.reservations, new.id)?;

        let state = self
            .get_shift(&new.shift_id)
            .ok_or(BookingError::ShiftNotFound(new.shift_id))?;
        let mut guard = state.write().await;
        check_reservable(&guard, &new.subject_id)?;

        let now = now();
        let reservation = Reservation {
            id: new.id,
            student_id: new.student_id,
            shift_id: new.shift_id,
            subject_id: new.subject_id,
            date: guard.shift.date,
            start_time: guard.shift.start_time,
            end_time: guard.shift.end_time,
            notes: new.notes,
            status: ReservationStatus::Confirmed,
            created_at: now,
            updated_at: now,
        };
        let event = Event::ReservationCreated { reservation: reservation.clone() };
        self.persist_and_apply(Some(&mut *guard), &event).await?;
        Ok(reservation)
    }

    pub async fn transition_reservation(
        &self,
        actor: &Principal,
        id: Ulid,
        to: ReservationStatus,
    ) -> Result<Reservation, BookingError> {
        let _gate = self.commit_gate.read().await;
        let shift_id = self
            .reservations
            .get(&id)
            .map(|r| r.shift_id)
            .ok_or(BookingError::ReservationNotFound(id))?;

        let state = self.get_shift(&shift_id);
        let mut guard = match &state {
            Some(s) => Some(s.write().await),
            None => None,
        };
        // Re-read under the shift lock; a concurrent transition may have won.
        let current = self
            .get_reservation(&id)
            .ok_or(BookingError::ReservationNotFound(id))?;
        let owner = guard
            .as_deref()
            .filter(|ss| !ss.retired)
            .map(|ss| ss.shift.teacher_id);
        check_transition(actor, &current, owner, to)?;

        let next = apply_transition(&current, to, now());
        let event = Event::ReservationUpdated { reservation: next.clone() };
        self.persist_and_apply(guard.as_deref_mut(), &event).await?;
        Ok(next)
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL as one creation event per live record.
    pub async fn compact_wal(&self) -> Result<(), BookingError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events = Vec::new();
        events.extend(
            self.profiles
                .iter()
                .map(|e| Event::ProfileRegistered { profile: e.value().clone() }),
        );
        events.extend(
            self.subjects
                .iter()
                .map(|e| Event::SubjectCreated { subject: e.value().clone() }),
        );

        let states: Vec<_> = self.shifts.iter().map(|e| e.value().clone()).collect();
        for state in states {
            let guard = state.read().await;
            if !guard.retired {
                events.push(Event::ShiftCreated { shift: guard.shift.clone() });
            }
        }

        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationCreated { reservation }),
        );

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| BookingError::RemoteUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::RemoteUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::Storage(e.to_string()))
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

    // ── Helpers ──────────────────────────────────────────

    /// A teacher creates shifts for themselves; an admin for any teacher profile.
    fn authorize_shift_creation(&self, actor: &Principal, teacher_id: &Ulid) -> Result<(), BookingError> {
        if actor.is_teacher(teacher_id) {
            return Ok(());
        }
        if !actor.is_admin() {
            return Err(BookingError::Unauthorized("teachers create shifts for themselves only"));
        }
        match self.get_profile(teacher_id) {
            Some(p) if p.role == Role::Teacher => Ok(()),
            Some(_) => Err(BookingError::Invalid("shift owner must be a teacher")),
            None => Err(BookingError::ProfileNotFound(teacher_id.to_string())),
        }
    }

    fn validate_subject_set(&self, subject_ids: &BTreeSet<Ulid>) -> Result<(), BookingError> {
        if subject_ids.is_empty() {
            return Err(BookingError::EmptySubjects);
        }
        if subject_ids.len() > MAX_SUBJECTS_PER_SHIFT {
            return Err(BookingError::LimitExceeded("too many subjects on shift"));
        }
        match subject_ids.iter().find(|id| !self.subjects.contains_key(id)) {
            Some(missing) => Err(BookingError::SubjectNotFound(*missing)),
            None => Ok(()),
        }
    }

    /// Spans of the teacher's live shifts on `date`.
    async fn teacher_spans_on(&self, teacher_id: Ulid, date: NaiveDate) -> Vec<(Ulid, Span)> {
        let ids = self
            .teacher_shifts
            .get(&teacher_id)
            .map(|owned| owned.value().clone())
            .unwrap_or_default();
        let mut spans = Vec::new();
        for id in ids {
            let Some(state) = self.get_shift(&id) else {
                continue;
            };
            let guard = state.read().await;
            if !guard.retired && guard.shift.date == date {
                spans.push((id, guard.shift.span()));
            }
        }
        spans
    }
}

fn authorize_shift_owner(actor: &Principal, teacher_id: &Ulid) -> Result<(), BookingError> {
    if actor.is_admin() || actor.is_teacher(teacher_id) {
        Ok(())
    } else {
        Err(BookingError::Unauthorized("only the owning teacher or an admin can change a shift"))
    }
}
