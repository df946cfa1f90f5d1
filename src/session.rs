//! One authenticated principal's view of a studio.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::cache::StateCache;
use crate::engine::{AvailabilityQuery, available_dates, available_shifts};
use crate::error::BookingError;
use crate::model::*;
use crate::notify::{self, Notifier};
use crate::report::{self, Stats};
use crate::service::DataService;

/// Wraps a data service with the caller's principal, a private read cache and
/// a notifier. Reads come from the cache; every successful mutation drops it
/// and fetches a fresh snapshot before returning.
pub struct Session<S: DataService + ?Sized> {
    principal: Principal,
    service: Arc<S>,
    cache: StateCache,
    notifier: Arc<dyn Notifier>,
}

impl<S: DataService + ?Sized> Session<S> {
    pub fn new(principal: Principal, service: Arc<S>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            principal,
            service,
            cache: StateCache::new(),
            notifier,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Drop the cached snapshot; the next read fetches.
    pub fn invalidate(&mut self) {
        self.cache.invalidate();
    }

    pub async fn refresh(&mut self) -> Result<Arc<Snapshot>, BookingError> {
        self.cache.refresh(self.service.as_ref()).await
    }

    pub async fn snapshot(&mut self) -> Result<Arc<Snapshot>, BookingError> {
        self.cache.current(self.service.as_ref()).await
    }

    async fn after_commit(&mut self) {
        if let Err(e) = self.refresh().await {
            tracing::warn!("cache refresh after commit failed: {e}");
        }
    }

    // ── Availability ─────────────────────────────────────

    pub async fn available(&mut self, query: &AvailabilityQuery) -> Result<Vec<Shift>, BookingError> {
        let snap = self.snapshot().await?;
        Ok(available_shifts(&snap.shifts, &snap.reservations, query)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn available_on(&mut self, date: NaiveDate) -> Result<Vec<Shift>, BookingError> {
        self.available(&AvailabilityQuery::Date(date)).await
    }

    pub async fn available_for_subject(
        &mut self,
        subject_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Shift>, BookingError> {
        self.available(&AvailabilityQuery::Subject { subject_id, date }).await
    }

    pub async fn available_dates(&mut self) -> Result<BTreeSet<NaiveDate>, BookingError> {
        let snap = self.snapshot().await?;
        Ok(available_dates(&snap.shifts, &snap.reservations))
    }

    // ── Role-scoped views ────────────────────────────────

    /// Admins see every profile; anyone else sees only their own.
    pub async fn profiles(&mut self) -> Result<Vec<Profile>, BookingError> {
        let principal = self.principal;
        let snap = self.snapshot().await?;
        Ok(snap
            .profiles
            .iter()
            .filter(|p| principal.is_admin() || p.id == principal.id)
            .cloned()
            .collect())
    }

    pub async fn subjects(&mut self) -> Result<Vec<Subject>, BookingError> {
        Ok(self.snapshot().await?.subjects.clone())
    }

    /// Teachers see their own shifts; everyone else sees all of them.
    pub async fn visible_shifts(&mut self) -> Result<Vec<Shift>, BookingError> {
        let principal = self.principal;
        let snap = self.snapshot().await?;
        Ok(snap
            .shifts
            .iter()
            .filter(|s| principal.role != Role::Teacher || s.teacher_id == principal.id)
            .cloned()
            .collect())
    }

    /// Students see their own reservations, teachers those on their shifts,
    /// admins everything.
    pub async fn visible_reservations(&mut self) -> Result<Vec<Reservation>, BookingError> {
        let principal = self.principal;
        let snap = self.snapshot().await?;
        Ok(snap
            .reservations
            .iter()
            .filter(|r| match principal.role {
                Role::Admin => true,
                Role::Student => r.student_id == principal.id,
                Role::Teacher => snap.reservation_view(r).teacher_id == Some(principal.id),
            })
            .cloned()
            .collect())
    }

    // ── Mutations ────────────────────────────────────────

    pub async fn register_profile(&mut self, new: NewProfile) -> Result<Profile, BookingError> {
        let profile = self.service.register_profile(&self.principal, new).await?;
        self.after_commit().await;
        Ok(profile)
    }

    pub async fn verify_profile(&mut self, id: Ulid) -> Result<Profile, BookingError> {
        let profile = self.service.verify_profile(&self.principal, id).await?;
        self.after_commit().await;
        Ok(profile)
    }

    pub async fn create_subject(&mut self, id: Ulid, name: String) -> Result<Subject, BookingError> {
        let subject = self.service.create_subject(&self.principal, id, name).await?;
        self.after_commit().await;
        Ok(subject)
    }

    pub async fn create_shift(&mut self, new: NewShift) -> Result<Shift, BookingError> {
        let shift = self.service.create_shift(&self.principal, new).await?;
        self.after_commit().await;
        Ok(shift)
    }

    pub async fn update_shift(&mut self, id: Ulid, changes: ShiftChanges) -> Result<Shift, BookingError> {
        let shift = self.service.update_shift(&self.principal, id, changes).await?;
        self.after_commit().await;
        Ok(shift)
    }

    pub async fn delete_shift(&mut self, id: Ulid) -> Result<(), BookingError> {
        self.service.delete_shift(&self.principal, id).await?;
        self.after_commit().await;
        Ok(())
    }

    /// Reserve a shift, then mail the student and the teacher.
    pub async fn reserve(&mut self, new: NewReservation) -> Result<Reservation, BookingError> {
        let reservation = self.service.create_reservation(&self.principal, new).await?;
        self.after_commit().await;
        self.notify_booked(&reservation).await;
        Ok(reservation)
    }

    pub async fn transition(&mut self, id: Ulid, to: ReservationStatus) -> Result<Reservation, BookingError> {
        let reservation = self
            .service
            .transition_reservation(&self.principal, id, to)
            .await?;
        self.after_commit().await;
        Ok(reservation)
    }

    pub async fn cancel(&mut self, id: Ulid) -> Result<Reservation, BookingError> {
        self.transition(id, ReservationStatus::Cancelled).await
    }

    pub async fn complete(&mut self, id: Ulid) -> Result<Reservation, BookingError> {
        self.transition(id, ReservationStatus::Completed).await
    }

    async fn notify_booked(&mut self, reservation: &Reservation) {
        let snap = match self.snapshot().await {
            Ok(snap) => snap,
            Err(e) => {
                tracing::warn!("skipping notifications for {}: {e}", reservation.id);
                return;
            }
        };
        let subject = snap.subject_name(&reservation.subject_id);
        let Some(student) = snap.profile(&reservation.student_id) else {
            tracing::debug!("no profile for student {}", reservation.student_id);
            return;
        };
        notify::dispatch(
            self.notifier.clone(),
            notify::reservation_confirmation(student, reservation, &subject),
        );
        if let Some(shift) = snap.shift(&reservation.shift_id)
            && let Some(teacher) = snap.profile(&shift.teacher_id)
        {
            notify::dispatch(
                self.notifier.clone(),
                notify::reservation_notice(teacher, student, shift, reservation, &subject),
            );
        }
    }

    // ── Reports ──────────────────────────────────────────

    /// Reports always work from a fresh fetch.
    async fn report_snapshot(&mut self) -> Result<Arc<Snapshot>, BookingError> {
        if !self.principal.is_admin() {
            return Err(BookingError::Unauthorized("reports are admin only"));
        }
        self.refresh().await
    }

    pub async fn stats(&mut self) -> Result<Stats, BookingError> {
        let snap = self.report_snapshot().await?;
        Ok(Stats::from_snapshot(&snap))
    }

    pub async fn export_reservations_csv(&mut self) -> Result<String, BookingError> {
        let snap = self.report_snapshot().await?;
        report::reservations_csv(&snap)
    }

    pub async fn export_shifts_csv(&mut self) -> Result<String, BookingError> {
        let snap = self.report_snapshot().await?;
        report::shifts_csv(&snap)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::NaiveTime;

    use super::*;
    use crate::engine::Engine;
    use crate::error::ErrorKind;
    use crate::notify::testing::RecordingNotifier;
    use crate::service::testing::FlakyService;

    fn wal(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_session");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn june1() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    struct Fixture {
        service: Arc<FlakyService>,
        mail: Arc<RecordingNotifier>,
        admin: Session<FlakyService>,
        teacher: Session<FlakyService>,
        alice: Session<FlakyService>,
        bob: Session<FlakyService>,
        math: Ulid,
    }

    async fn fixture(name: &str) -> Fixture {
        let service = Arc::new(FlakyService::new(Engine::new(wal(name)).unwrap()));
        let mail = Arc::new(RecordingNotifier::default());
        let mut admin = Session::new(Principal::bootstrap_admin(), service.clone(), mail.clone());

        let mut people = Vec::new();
        for (email, name, role) in [
            ("sato@studio.test", "Sato", Role::Teacher),
            ("alice@studio.test", "Alice", Role::Student),
            ("bob@studio.test", "Bob", Role::Student),
        ] {
            let p = admin
                .register_profile(NewProfile { id: Ulid::new(), email: email.into(), name: name.into(), role })
                .await
                .unwrap();
            admin.verify_profile(p.id).await.unwrap();
            people.push(Session::new(Principal::new(p.id, role), service.clone(), mail.clone()));
        }
        let bob = people.pop().unwrap();
        let alice = people.pop().unwrap();
        let mut teacher = people.pop().unwrap();
        let math = teacher.create_subject(Ulid::new(), "Math".into()).await.unwrap().id;

        Fixture { service, mail, admin, teacher, alice, bob, math }
    }

    impl Fixture {
        async fn math_shift(&mut self, start: u32) -> Shift {
            let teacher_id = self.teacher.principal().id;
            self.teacher
                .create_shift(NewShift {
                    id: Ulid::new(),
                    teacher_id,
                    date: june1(),
                    start_time: t(start),
                    end_time: t(start + 1),
                    subject_ids: [self.math].into_iter().collect(),
                })
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn booking_scenario_across_sessions() {
        let mut f = fixture("scenario.wal").await;
        let shift = f.math_shift(9).await;

        // Bob loads availability before Alice books.
        assert_eq!(f.bob.available_on(june1()).await.unwrap(), vec![shift.clone()]);

        let alice_id = f.alice.principal().id;
        let r = f
            .alice
            .reserve(NewReservation::new(alice_id, shift.id, f.math, ""))
            .await
            .unwrap();
        assert_eq!(r.status, ReservationStatus::Confirmed);
        assert!(f.alice.available_on(june1()).await.unwrap().is_empty());

        // Bob's cache is stale until something refreshes it.
        assert_eq!(f.bob.available_on(june1()).await.unwrap().len(), 1);
        f.bob.refresh().await.unwrap();
        assert!(f.bob.available_on(june1()).await.unwrap().is_empty());

        let bob_id = f.bob.principal().id;
        let err = f
            .bob
            .reserve(NewReservation::new(bob_id, shift.id, f.math, ""))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        f.teacher.cancel(r.id).await.unwrap();
        f.bob.refresh().await.unwrap();
        assert_eq!(f.bob.available_on(june1()).await.unwrap(), vec![shift]);
    }

    #[tokio::test]
    async fn mutation_refreshes_the_cache() {
        let mut f = fixture("refresh_after_commit.wal").await;
        f.teacher.snapshot().await.unwrap();
        let before = f.service.snapshots();

        let shift = f.math_shift(9).await;
        assert_eq!(f.service.snapshots(), before + 1);
        // Served from the refreshed cache, no extra fetch.
        assert_eq!(f.teacher.visible_shifts().await.unwrap(), vec![shift]);
        assert_eq!(f.service.snapshots(), before + 1);
    }

    #[tokio::test]
    async fn failed_mutation_leaves_cache_alone() {
        let mut f = fixture("failed_mutation.wal").await;
        let shift = f.math_shift(9).await;
        f.alice.snapshot().await.unwrap();
        let before = f.service.snapshots();

        f.service.set_down(true);
        let alice_id = f.alice.principal().id;
        let err = f
            .alice
            .reserve(NewReservation::new(alice_id, shift.id, f.math, ""))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteUnavailable);
        assert_eq!(f.service.snapshots(), before);

        // Cached reads keep working while the service is down.
        assert_eq!(f.alice.available_on(june1()).await.unwrap(), vec![shift]);
    }

    #[tokio::test]
    async fn reads_are_scoped_by_role() {
        let mut f = fixture("scoped_reads.wal").await;
        let shift = f.math_shift(9).await;
        let later = f.math_shift(11).await;
        let alice_id = f.alice.principal().id;
        let bob_id = f.bob.principal().id;
        let mine = f.alice.reserve(NewReservation::new(alice_id, shift.id, f.math, "")).await.unwrap();
        let theirs = f.bob.reserve(NewReservation::new(bob_id, later.id, f.math, "")).await.unwrap();

        let ids = |rs: Vec<Reservation>| rs.into_iter().map(|r| r.id).collect::<Vec<_>>();
        f.alice.refresh().await.unwrap();
        assert_eq!(ids(f.alice.visible_reservations().await.unwrap()), vec![mine.id]);
        // Other sessions keep their cached snapshot until refreshed.
        assert!(f.teacher.visible_reservations().await.unwrap().is_empty());
        f.teacher.refresh().await.unwrap();
        f.admin.refresh().await.unwrap();
        assert_eq!(ids(f.teacher.visible_reservations().await.unwrap()), vec![mine.id, theirs.id]);
        assert_eq!(f.admin.visible_reservations().await.unwrap().len(), 2);

        let mut other = Session::new(
            Principal::new(Ulid::new(), Role::Teacher),
            f.service.clone(),
            f.mail.clone(),
        );
        assert!(other.visible_reservations().await.unwrap().is_empty());
        assert!(other.visible_shifts().await.unwrap().is_empty());
        assert_eq!(f.bob.visible_shifts().await.unwrap().len(), 2);

        assert_eq!(f.admin.profiles().await.unwrap().len(), 3);
        let own = f.alice.profiles().await.unwrap();
        assert_eq!(own.iter().map(|p| p.id).collect::<Vec<_>>(), vec![alice_id]);
    }

    #[tokio::test]
    async fn reserve_mails_student_and_teacher() {
        let mut f = fixture("mail.wal").await;
        let shift = f.math_shift(9).await;
        let alice_id = f.alice.principal().id;
        f.alice
            .reserve(NewReservation::new(alice_id, shift.id, f.math, "algebra"))
            .await
            .unwrap();

        let mut sent = Vec::new();
        for _ in 0..50 {
            sent = f.mail.sent.lock().await.clone();
            if sent.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut recipients: Vec<_> = sent.iter().map(|m| m.to.as_str()).collect();
        recipients.sort();
        assert_eq!(recipients, vec!["alice@studio.test", "sato@studio.test"]);
        assert!(sent.iter().any(|m| m.body.contains("Notes: algebra")));
    }

    #[tokio::test]
    async fn reports_are_admin_only_and_fresh() {
        let mut f = fixture("reports.wal").await;
        let shift = f.math_shift(9).await;
        f.math_shift(10).await;
        f.admin.snapshot().await.unwrap();

        let alice_id = f.alice.principal().id;
        f.alice
            .reserve(NewReservation::new(alice_id, shift.id, f.math, r#"he said "hi""#))
            .await
            .unwrap();

        assert_eq!(f.teacher.stats().await.unwrap_err().kind(), ErrorKind::Unauthorized);
        assert!(f.alice.export_reservations_csv().await.is_err());

        // The admin's cache predates the reservation; reports still see it.
        let stats = f.admin.stats().await.unwrap();
        assert_eq!((stats.total_shifts, stats.active_reservations, stats.occupancy_rate), (2, 1, 50));

        let csv = f.admin.export_reservations_csv().await.unwrap();
        assert!(csv.contains(r#""he said ""hi""""#));
        assert!(csv.contains(",Alice,"));
        let shifts = f.admin.export_shifts_csv().await.unwrap();
        assert!(shifts.contains(",Math,reserved\r\n"));
        assert!(shifts.contains(",Math,open\r\n"));
    }
}
