//! Read-only projections over a snapshot: occupancy statistics and CSV export.

use crate::error::BookingError;
use crate::model::{ReservationStatus, Snapshot};

use crate::engine::reserved_shift_ids;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub total_shifts: usize,
    pub active_reservations: usize,
    pub completed_reservations: usize,
    pub cancelled_reservations: usize,
    /// Whole percent of shifts holding an active reservation.
    pub occupancy_rate: u32,
}

/// `round(100 * active / total)` with halves rounded up; 0 when there are no shifts.
pub fn occupancy_rate(active: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    let (active, total) = (active as u64, total as u64);
    ((200 * active + total) / (2 * total)) as u32
}

impl Stats {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let count = |status: ReservationStatus| {
            snapshot
                .reservations
                .iter()
                .filter(|r| r.status == status)
                .count()
        };
        let total_shifts = snapshot.shifts.len();
        let active_reservations = snapshot.reservations.iter().filter(|r| r.is_active()).count();
        Self {
            total_shifts,
            active_reservations,
            completed_reservations: count(ReservationStatus::Completed),
            cancelled_reservations: count(ReservationStatus::Cancelled),
            occupancy_rate: occupancy_rate(active_reservations, total_shifts),
        }
    }
}

const RESERVATION_COLUMNS: [&str; 10] = [
    "id",
    "student_id",
    "student_name",
    "date",
    "start_time",
    "end_time",
    "subject",
    "status",
    "notes",
    "created_at",
];

const SHIFT_COLUMNS: [&str; 7] = [
    "id",
    "teacher_id",
    "date",
    "start_time",
    "end_time",
    "subjects",
    "reservation",
];

fn csv_writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new())
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String, BookingError> {
    let bytes = writer
        .into_inner()
        .map_err(|e| BookingError::Storage(format!("csv flush: {e}")))?;
    String::from_utf8(bytes).map_err(|e| BookingError::Storage(format!("csv encoding: {e}")))
}

fn csv_error(e: csv::Error) -> BookingError {
    BookingError::Storage(format!("csv write: {e}"))
}

/// One row per reservation, joined to student and subject.
pub fn reservations_csv(snapshot: &Snapshot) -> Result<String, BookingError> {
    let mut writer = csv_writer();
    writer.write_record(RESERVATION_COLUMNS).map_err(csv_error)?;
    for reservation in &snapshot.reservations {
        let view = snapshot.reservation_view(reservation);
        let subject = view
            .subject
            .map_or_else(|| reservation.subject_id.to_string(), |s| s.name.clone());
        let student_name = view.student.map(|p| p.name.as_str()).unwrap_or_default();
        writer
            .write_record([
                reservation.id.to_string().as_str(),
                reservation.student_id.to_string().as_str(),
                student_name,
                reservation.date.to_string().as_str(),
                reservation.start_time.format("%H:%M").to_string().as_str(),
                reservation.end_time.format("%H:%M").to_string().as_str(),
                subject.as_str(),
                reservation.status.as_str(),
                reservation.notes.as_str(),
                reservation.created_at.to_rfc3339().as_str(),
            ])
            .map_err(csv_error)?;
    }
    finish(writer)
}

/// One row per shift, with subject names joined by ` / `.
pub fn shifts_csv(snapshot: &Snapshot) -> Result<String, BookingError> {
    let reserved = reserved_shift_ids(&snapshot.reservations);
    let mut writer = csv_writer();
    writer.write_record(SHIFT_COLUMNS).map_err(csv_error)?;
    for shift in &snapshot.shifts {
        let subjects = shift
            .subject_ids
            .iter()
            .map(|id| snapshot.subject_name(id))
            .collect::<Vec<_>>()
            .join(" / ");
        let reservation = if reserved.contains(&shift.id) { "reserved" } else { "open" };
        writer
            .write_record([
                shift.id.to_string().as_str(),
                shift.teacher_id.to_string().as_str(),
                shift.date.to_string().as_str(),
                shift.start_time.format("%H:%M").to_string().as_str(),
                shift.end_time.format("%H:%M").to_string().as_str(),
                subjects.as_str(),
                reservation,
            ])
            .map_err(csv_error)?;
    }
    finish(writer)
}
