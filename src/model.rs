use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::BookingError;

/// Wall-clock instant used for `created_at` / `updated_at`.
pub type Timestamp = DateTime<Utc>;

/// Half-open time-of-day interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Span {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Validating constructor for caller-supplied times.
    pub fn try_new(start: NaiveTime, end: NaiveTime) -> Result<Self, BookingError> {
        if start >= end {
            return Err(BookingError::InvalidTimeRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            "admin" => Ok(Role::Admin),
            _ => Err(BookingError::Invalid("unknown role")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    /// Everything except `Cancelled` holds the shift.
    pub fn is_active(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }

    /// No transition leaves these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationStatus::Completed | ReservationStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(ReservationStatus::Pending),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "completed" => Ok(ReservationStatus::Completed),
            "cancelled" | "canceled" => Ok(ReservationStatus::Cancelled),
            _ => Err(BookingError::Invalid("unknown reservation status")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub role: Role,
    /// Set once the email address has been confirmed.
    pub verified_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Profile {
    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: Ulid,
    pub name: String,
    pub created_at: Timestamp,
}

/// A block of time a teacher is available to teach one or more subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub id: Ulid,
    pub teacher_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub subject_ids: BTreeSet<Ulid>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Shift {
    pub fn span(&self) -> Span {
        Span::new(self.start_time, self.end_time)
    }

    pub fn offers(&self, subject_id: &Ulid) -> bool {
        self.subject_ids.contains(subject_id)
    }
}

/// A student's claim on a shift for one subject.
///
/// `date`, `start_time` and `end_time` are copied from the shift when the
/// reservation is created and never re-derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub student_id: Ulid,
    pub shift_id: Ulid,
    pub subject_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub notes: String,
    pub status: ReservationStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Authenticated identity passed into every mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub id: Ulid,
    pub role: Role,
}

impl Principal {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    /// Built-in administrator used to bootstrap a fresh studio.
    pub fn bootstrap_admin() -> Self {
        Self { id: Ulid::nil(), role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_teacher(&self, teacher_id: &Ulid) -> bool {
        self.role == Role::Teacher && self.id == *teacher_id
    }

    pub fn is_student(&self, student_id: &Ulid) -> bool {
        self.role == Role::Student && self.id == *student_id
    }
}

// ── Command inputs ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewShift {
    pub id: Ulid,
    pub teacher_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub subject_ids: BTreeSet<Ulid>,
}

/// Partial edit of an existing shift. `None` keeps the current value; the
/// owner never changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShiftChanges {
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub subject_ids: Option<BTreeSet<Ulid>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub student_id: Ulid,
    pub shift_id: Ulid,
    pub subject_id: Ulid,
    pub notes: String,
}

impl NewReservation {
    pub fn new(student_id: Ulid, shift_id: Ulid, subject_id: Ulid, notes: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            student_id,
            shift_id,
            subject_id,
            notes: notes.into(),
        }
    }
}

// ── Server-side shift state ──────────────────────────────────────

/// A shift plus the reservation bookkeeping guarded by the shift's lock.
#[derive(Debug, Clone)]
pub struct ShiftState {
    pub shift: Shift,
    /// Every reservation ever made against this shift, oldest first.
    pub reservation_ids: Vec<Ulid>,
    /// The single non-cancelled reservation, if any.
    pub active: Option<Ulid>,
    /// Set when the shift is deleted while someone still holds its Arc.
    pub retired: bool,
}

impl ShiftState {
    pub fn new(shift: Shift) -> Self {
        Self {
            shift,
            reservation_ids: Vec::new(),
            active: None,
            retired: false,
        }
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProfileRegistered { profile: Profile },
    ProfileVerified { id: Ulid, at: Timestamp },
    SubjectCreated { subject: Subject },
    ShiftCreated { shift: Shift },
    ShiftUpdated { shift: Shift },
    ShiftDeleted { id: Ulid, teacher_id: Ulid },
    ReservationCreated { reservation: Reservation },
    /// Full-record replacement; used for every status transition.
    ReservationUpdated { reservation: Reservation },
}

impl Event {
    /// The shift whose lock must be held while applying this event.
    pub fn shift_id(&self) -> Option<Ulid> {
        match self {
            Event::ShiftUpdated { shift } => Some(shift.id),
            Event::ShiftDeleted { id, .. } => Some(*id),
            Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
                Some(reservation.shift_id)
            }
            Event::ProfileRegistered { .. }
            | Event::ProfileVerified { .. }
            | Event::SubjectCreated { .. }
            | Event::ShiftCreated { .. } => None,
        }
    }
}

// ── Read model ───────────────────────────────────────────────────

/// Point-in-time copy of all four collections, as fetched from the data service.
///
/// Subjects are ordered by name; shifts and reservations by date, then start time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub profiles: Vec<Profile>,
    pub subjects: Vec<Subject>,
    pub shifts: Vec<Shift>,
    pub reservations: Vec<Reservation>,
}

impl Snapshot {
    pub fn profile(&self, id: &Ulid) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == *id)
    }

    pub fn subject(&self, id: &Ulid) -> Option<&Subject> {
        self.subjects.iter().find(|s| s.id == *id)
    }

    pub fn shift(&self, id: &Ulid) -> Option<&Shift> {
        self.shifts.iter().find(|s| s.id == *id)
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn subject_name(&self, id: &Ulid) -> String {
        self.subject(id)
            .map_or_else(|| id.to_string(), |s| s.name.clone())
    }

    /// Reservation joined one hop out to student, subject and shift owner.
    pub fn reservation_view<'a>(&'a self, reservation: &'a Reservation) -> ReservationView<'a> {
        ReservationView {
            reservation,
            student: self.profile(&reservation.student_id),
            subject: self.subject(&reservation.subject_id),
            teacher_id: self.shift(&reservation.shift_id).map(|s| s.teacher_id),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReservationView<'a> {
    pub reservation: &'a Reservation,
    pub student: Option<&'a Profile>,
    pub subject: Option<&'a Subject>,
    /// `None` once the shift has been deleted.
    pub teacher_id: Option<Ulid>,
}
