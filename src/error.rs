//! Domain error type shared by the engine, the session and the wire layer.

use chrono::NaiveTime;
use thiserror::Error;
use ulid::Ulid;

use crate::model::ReservationStatus;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A referenced shift, subject, reservation or profile is absent.
    NotFound,
    /// The record exists but its current state forbids the operation.
    InvalidState,
    /// The write collides with another record (overlapping shift, duplicate id).
    Conflict,
    /// Malformed input.
    Validation,
    /// The principal lacks the capability for the operation.
    Unauthorized,
    /// The data service could not be reached.
    RemoteUnavailable,
    LimitExceeded,
    Storage,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BookingError {
    #[error("shift not found: {0}")]
    ShiftNotFound(Ulid),

    #[error("subject not found: {0}")]
    SubjectNotFound(Ulid),

    #[error("reservation not found: {0}")]
    ReservationNotFound(Ulid),

    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("subject {subject} is not offered by shift {shift}")]
    SubjectNotOfferedByShift { shift: Ulid, subject: Ulid },

    #[error("shift {shift} is already reserved by {reservation}")]
    ShiftAlreadyReserved { shift: Ulid, reservation: Ulid },

    #[error("cannot delete shift {shift}: active reservation {reservation}")]
    ShiftHasActiveReservation { shift: Ulid, reservation: Ulid },

    #[error("cannot move reservation from {from} to {to}{}", terminal_note(.from))]
    IllegalTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },

    #[error("shift overlaps existing shift {0}")]
    OverlappingShift(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("shift must offer at least one subject")]
    EmptySubjects,

    #[error("start time {start} must be before end time {end}")]
    InvalidTimeRange { start: NaiveTime, end: NaiveTime },

    #[error("invalid input: {0}")]
    Invalid(&'static str),

    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("data service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("storage error: {0}")]
    Storage(String),
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ShiftNotFound(_)
            | Self::SubjectNotFound(_)
            | Self::ReservationNotFound(_)
            | Self::ProfileNotFound(_) => ErrorKind::NotFound,
            Self::SubjectNotOfferedByShift { .. }
            | Self::ShiftAlreadyReserved { .. }
            | Self::ShiftHasActiveReservation { .. }
            | Self::IllegalTransition { .. } => ErrorKind::InvalidState,
            Self::OverlappingShift(_) | Self::AlreadyExists(_) => ErrorKind::Conflict,
            Self::EmptySubjects | Self::InvalidTimeRange { .. } | Self::Invalid(_) => {
                ErrorKind::Validation
            }
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::RemoteUnavailable(_) => ErrorKind::RemoteUnavailable,
            Self::LimitExceeded(_) => ErrorKind::LimitExceeded,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ShiftNotFound(_) => "shift_not_found",
            Self::SubjectNotFound(_) => "subject_not_found",
            Self::ReservationNotFound(_) => "reservation_not_found",
            Self::ProfileNotFound(_) => "profile_not_found",
            Self::SubjectNotOfferedByShift { .. } => "subject_not_offered",
            Self::ShiftAlreadyReserved { .. } => "shift_already_reserved",
            Self::ShiftHasActiveReservation { .. } => "shift_has_active_reservation",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::OverlappingShift(_) => "overlapping_shift",
            Self::AlreadyExists(_) => "already_exists",
            Self::EmptySubjects => "empty_subjects",
            Self::InvalidTimeRange { .. } => "invalid_time_range",
            Self::Invalid(_) => "invalid",
            Self::Unauthorized(_) => "unauthorized",
            Self::RemoteUnavailable(_) => "remote_unavailable",
            Self::LimitExceeded(_) => "limit_exceeded",
            Self::Storage(_) => "storage",
        }
    }
}

fn terminal_note(from: &ReservationStatus) -> &'static str {
    if from.is_terminal() {
        ": reservation is closed"
    } else {
        ""
    }
}
