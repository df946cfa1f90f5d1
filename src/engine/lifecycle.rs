//! Reservation status transitions.
//!
//! The table is total: any `(from, to)` pair not listed is rejected, which also
//! makes `completed` and `cancelled` terminal.

use ulid::Ulid;

use crate::error::BookingError;
use crate::model::*;

use ReservationStatus::*;

/// Who may request a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// Only the teacher who owns the reservation's shift.
    OwningTeacher,
    /// The owning teacher or the student holding the reservation.
    TeacherOrStudent,
}

pub const TRANSITIONS: &[(ReservationStatus, ReservationStatus, Authority)] = &[
    (Pending, Confirmed, Authority::OwningTeacher),
    (Pending, Cancelled, Authority::OwningTeacher),
    (Confirmed, Completed, Authority::OwningTeacher),
    (Confirmed, Cancelled, Authority::TeacherOrStudent),
];

fn authority(from: ReservationStatus, to: ReservationStatus) -> Option<Authority> {
    TRANSITIONS
        .iter()
        .find(|(f, t, _)| *f == from && *t == to)
        .map(|(_, _, a)| *a)
}

/// `shift_owner` is `None` when the shift has since been deleted; the student
/// can still cancel, nobody can complete.
pub fn check_transition(
    principal: &Principal,
    reservation: &Reservation,
    shift_owner: Option<Ulid>,
    to: ReservationStatus,
) -> Result<(), BookingError> {
    let from = reservation.status;
    let Some(required) = authority(from, to) else {
        return Err(BookingError::IllegalTransition { from, to });
    };

    let is_owner = shift_owner.is_some_and(|t| principal.is_teacher(&t));
    let allowed = match required {
        Authority::OwningTeacher => is_owner,
        Authority::TeacherOrStudent => is_owner || principal.is_student(&reservation.student_id),
    };
    if !allowed {
        return Err(BookingError::Unauthorized("not a party to this reservation"));
    }
    Ok(())
}

/// Full-record replacement carrying the new status.
pub fn apply_transition(reservation: &Reservation, to: ReservationStatus, at: Timestamp) -> Reservation {
    Reservation {
        status: to,
        updated_at: at,
        ..reservation.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, Utc};

    const ALL: [ReservationStatus; 4] = [Pending, Confirmed, Completed, Cancelled];

    fn reservation(student: Ulid, status: ReservationStatus) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Ulid::new(),
            student_id: student,
            shift_id: Ulid::new(),
            subject_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            notes: String::new(),
            status,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        let teacher = Principal::new(Ulid::new(), Role::Teacher);
        for from in [Completed, Cancelled] {
            for to in ALL {
                let r = reservation(Ulid::new(), from);
                assert!(
                    matches!(
                        check_transition(&teacher, &r, Some(teacher.id), to),
                        Err(BookingError::IllegalTransition { .. })
                    ),
                    "{from} -> {to} should be illegal"
                );
            }
        }
    }

    #[test]
    fn self_transitions_are_illegal() {
        let teacher = Principal::new(Ulid::new(), Role::Teacher);
        for status in ALL {
            let r = reservation(Ulid::new(), status);
            assert!(check_transition(&teacher, &r, Some(teacher.id), status).is_err());
        }
    }

    #[test]
    fn owning_teacher_drives_the_lifecycle() {
        let teacher = Principal::new(Ulid::new(), Role::Teacher);
        let owner = Some(teacher.id);
        let student = Ulid::new();
        assert!(check_transition(&teacher, &reservation(student, Pending), owner, Confirmed).is_ok());
        assert!(check_transition(&teacher, &reservation(student, Pending), owner, Cancelled).is_ok());
        assert!(check_transition(&teacher, &reservation(student, Confirmed), owner, Completed).is_ok());
        assert!(check_transition(&teacher, &reservation(student, Confirmed), owner, Cancelled).is_ok());
    }

    #[test]
    fn other_teacher_is_unauthorized() {
        let teacher = Principal::new(Ulid::new(), Role::Teacher);
        let r = reservation(Ulid::new(), Confirmed);
        assert!(matches!(
            check_transition(&teacher, &r, Some(Ulid::new()), Completed),
            Err(BookingError::Unauthorized(_))
        ));
    }

    #[test]
    fn student_may_only_cancel_own_confirmed() {
        let student = Principal::new(Ulid::new(), Role::Student);
        let owner = Some(Ulid::new());
        let mine = reservation(student.id, Confirmed);
        assert!(check_transition(&student, &mine, owner, Cancelled).is_ok());
        assert!(matches!(
            check_transition(&student, &mine, owner, Completed),
            Err(BookingError::Unauthorized(_))
        ));

        let theirs = reservation(Ulid::new(), Confirmed);
        assert!(matches!(
            check_transition(&student, &theirs, owner, Cancelled),
            Err(BookingError::Unauthorized(_))
        ));

        let pending = reservation(student.id, Pending);
        assert!(matches!(
            check_transition(&student, &pending, owner, Cancelled),
            Err(BookingError::Unauthorized(_))
        ));
    }

    #[test]
    fn student_can_cancel_after_shift_deleted() {
        let student = Principal::new(Ulid::new(), Role::Student);
        let r = reservation(student.id, Confirmed);
        assert!(check_transition(&student, &r, None, Cancelled).is_ok());
    }

    #[test]
    fn admin_has_no_transition_authority() {
        let admin = Principal::bootstrap_admin();
        let r = reservation(Ulid::new(), Confirmed);
        assert!(matches!(
            check_transition(&admin, &r, Some(Ulid::new()), Cancelled),
            Err(BookingError::Unauthorized(_))
        ));
    }

    #[test]
    fn apply_keeps_snapshot_fields() {
        let r = reservation(Ulid::new(), Confirmed);
        let later = Utc::now();
        let next = apply_transition(&r, Cancelled, later);
        assert_eq!(next.status, Cancelled);
        assert_eq!(next.updated_at, later);
        assert_eq!((next.id, next.shift_id, next.subject_id), (r.id, r.shift_id, r.subject_id));
        assert_eq!((next.date, next.start_time, next.end_time), (r.date, r.start_time, r.end_time));
    }
}
