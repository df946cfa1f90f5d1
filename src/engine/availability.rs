use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// What a student is searching availability by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityQuery {
    Date(NaiveDate),
    /// Shifts offering the subject, optionally narrowed to one date.
    Subject {
        subject_id: Ulid,
        date: Option<NaiveDate>,
    },
}

impl AvailabilityQuery {
    pub fn matches(&self, shift: &Shift) -> bool {
        match self {
            AvailabilityQuery::Date(date) => shift.date == *date,
            AvailabilityQuery::Subject { subject_id, date } => {
                shift.offers(subject_id) && date.is_none_or(|d| shift.date == d)
            }
        }
    }
}

/// Shift ids held by at least one non-cancelled reservation.
pub fn reserved_shift_ids(reservations: &[Reservation]) -> HashSet<Ulid> {
    reservations
        .iter()
        .filter(|r| r.is_active())
        .map(|r| r.shift_id)
        .collect()
}

/// Shifts matching `query` with no active reservation, in input order.
pub fn available_shifts<'a>(
    shifts: &'a [Shift],
    reservations: &[Reservation],
    query: &AvailabilityQuery,
) -> Vec<&'a Shift> {
    let reserved = reserved_shift_ids(reservations);
    shifts
        .iter()
        .filter(|s| query.matches(s) && !reserved.contains(&s.id))
        .collect()
}

/// Dates with at least one bookable shift, for highlighting a calendar.
pub fn available_dates(shifts: &[Shift], reservations: &[Reservation]) -> BTreeSet<NaiveDate> {
    let reserved = reserved_shift_ids(reservations);
    shifts
        .iter()
        .filter(|s| !reserved.contains(&s.id))
        .map(|s| s.date)
        .collect()
}
