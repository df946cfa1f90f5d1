use ulid::Ulid;

use crate::model::*;

use super::Engine;

impl Engine {
    pub fn get_profile(&self, id: &Ulid) -> Option<Profile> {
        self.profiles.get(id).map(|e| e.value().clone())
    }

    /// Case-insensitive lookup, as email addresses are compared at login.
    pub fn find_profile_by_email(&self, email: &str) -> Option<Profile> {
        self.profiles
            .iter()
            .find(|e| e.value().email.eq_ignore_ascii_case(email))
            .map(|e| e.value().clone())
    }

    pub fn get_subject(&self, id: &Ulid) -> Option<Subject> {
        self.subjects.get(id).map(|e| e.value().clone())
    }

    pub fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|e| e.value().clone())
    }

    pub fn list_profiles(&self) -> Vec<Profile> {
        let mut profiles: Vec<Profile> = self.profiles.iter().map(|e| e.value().clone()).collect();
        profiles.sort_by(|a, b| a.email.cmp(&b.email));
        profiles
    }

    /// Subjects in name order; duplicate names fall back to id order.
    pub fn list_subjects(&self) -> Vec<Subject> {
        let mut subjects: Vec<Subject> = self.subjects.iter().map(|e| e.value().clone()).collect();
        subjects.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        subjects
    }

    pub async fn list_shifts(&self) -> Vec<Shift> {
        let states: Vec<_> = self.shifts.iter().map(|e| e.value().clone()).collect();
        let mut shifts = Vec::with_capacity(states.len());
        for state in states {
            let guard = state.read().await;
            if !guard.retired {
                shifts.push(guard.shift.clone());
            }
        }
        shifts.sort_by_key(|s| (s.date, s.start_time, s.id));
        shifts
    }

    pub fn list_reservations(&self) -> Vec<Reservation> {
        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| (r.date, r.start_time, r.id));
        reservations
    }

    /// Point-in-time copy of all four collections.
    ///
    /// Each collection is consistent on its own; a commit landing between the
    /// reads may show up in one and not another. Callers re-fetch after their
    /// own mutations, which always observe the committed state.
    pub async fn snapshot(&self) -> Snapshot {
        let shifts = self.list_shifts().await;
        Snapshot {
            profiles: self.list_profiles(),
            subjects: self.list_subjects(),
            shifts,
            reservations: self.list_reservations(),
        }
    }

    /// The active reservation on a shift, if any.
    pub async fn active_reservation(&self, shift_id: &Ulid) -> Option<Reservation> {
        let state = self.get_shift(shift_id)?;
        let active = state.read().await.active?;
        self.get_reservation(&active)
    }

    pub fn shift_count(&self) -> usize {
        self.shifts.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }
}
