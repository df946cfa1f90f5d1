use chrono::{NaiveTime, Utc};
use ulid::Ulid;

use crate::error::BookingError;
use crate::limits::*;
use crate::model::*;

pub(crate) fn now() -> Timestamp {
    Utc::now()
}

pub(crate) fn validate_span(start: NaiveTime, end: NaiveTime) -> Result<Span, BookingError> {
    Span::try_new(start, end)
}

pub(crate) fn validate_name(name: &str) -> Result<(), BookingError> {
    if name.trim().is_empty() {
        return Err(BookingError::Invalid("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(BookingError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<(), BookingError> {
    if email.len() > MAX_EMAIL_LEN {
        return Err(BookingError::LimitExceeded("email too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(BookingError::Invalid("malformed email address")),
    }
}

pub(crate) fn validate_notes(notes: &str) -> Result<(), BookingError> {
    if notes.len() > MAX_NOTES_LEN {
        return Err(BookingError::LimitExceeded("notes too long"));
    }
    Ok(())
}

/// Half-open overlap test against the teacher's other shifts on the same date.
pub(crate) fn check_no_overlap(
    span: &Span,
    same_day: impl IntoIterator<Item = (Ulid, Span)>,
) -> Result<(), BookingError> {
    for (id, existing) in same_day {
        if span.overlaps(&existing) {
            return Err(BookingError::OverlappingShift(id));
        }
    }
    Ok(())
}

/// Reservation preconditions that depend on shift state, in the order they are reported.
pub(crate) fn check_reservable(ss: &ShiftState, subject_id: &Ulid) -> Result<(), BookingError> {
    if ss.retired {
        return Err(BookingError::ShiftNotFound(ss.shift.id));
    }
    if !ss.shift.offers(subject_id) {
        return Err(BookingError::SubjectNotOfferedByShift {
            shift: ss.shift.id,
            subject: *subject_id,
        });
    }
    if let Some(reservation) = ss.active {
        return Err(BookingError::ShiftAlreadyReserved {
            shift: ss.shift.id,
            reservation,
        });
    }
    Ok(())
}

pub(crate) fn check_deletable(ss: &ShiftState) -> Result<(), BookingError> {
    if let Some(reservation) = ss.active {
        return Err(BookingError::ShiftHasActiveReservation {
            shift: ss.shift.id,
            reservation,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn state(subjects: &[Ulid]) -> ShiftState {
        let now = now();
        ShiftState::new(Shift {
            id: Ulid::new(),
            teacher_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            start_time: t(9, 0),
            end_time: t(10, 0),
            subject_ids: subjects.iter().copied().collect(),
            created_at: now,
            updated_at: now,
        })
    }

    #[test]
    fn overlap_uses_half_open_intervals() {
        let other = Ulid::new();
        let existing = [(other, Span::new(t(9, 0), t(10, 0)))];

        let adjacent = Span::new(t(10, 0), t(11, 0));
        assert!(check_no_overlap(&adjacent, existing).is_ok());

        let clash = Span::new(t(9, 30), t(10, 30));
        assert!(matches!(
            check_no_overlap(&clash, existing),
            Err(BookingError::OverlappingShift(id)) if id == other
        ));
    }

    #[test]
    fn reservable_reports_subject_before_occupancy() {
        let math = Ulid::new();
        let mut ss = state(&[math]);
        ss.active = Some(Ulid::new());

        // Wrong subject on an occupied shift still reports the subject problem first.
        assert!(matches!(
            check_reservable(&ss, &Ulid::new()),
            Err(BookingError::SubjectNotOfferedByShift { .. })
        ));
        assert!(matches!(
            check_reservable(&ss, &math),
            Err(BookingError::ShiftAlreadyReserved { .. })
        ));

        ss.active = None;
        assert!(check_reservable(&ss, &math).is_ok());
    }

    #[test]
    fn retired_shift_is_not_reservable() {
        let math = Ulid::new();
        let mut ss = state(&[math]);
        ss.retired = true;
        assert!(matches!(
            check_reservable(&ss, &math),
            Err(BookingError::ShiftNotFound(_))
        ));
    }

    #[test]
    fn deletable_only_without_active_reservation() {
        let mut ss = state(&[Ulid::new()]);
        assert!(check_deletable(&ss).is_ok());
        ss.active = Some(Ulid::new());
        assert!(matches!(
            check_deletable(&ss),
            Err(BookingError::ShiftHasActiveReservation { .. })
        ));
    }

    #[test]
    fn email_shape() {
        assert!(validate_email("kana@example.com").is_ok());
        assert!(validate_email("kana").is_err());
        assert!(validate_email("@example.com").is_err());
    }
}
