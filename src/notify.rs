use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Profile, Reservation, Shift};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("mail transport rejected message: {0}")]
    Rejected(String),
    #[error("mail transport unreachable: {0}")]
    Unreachable(String),
}

/// Outbound mail. Delivery is best effort; callers never retry.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, email: Email) -> Result<(), NotifyError>;
}

/// Writes mail to the log instead of delivering it.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, email: Email) -> Result<(), NotifyError> {
        tracing::info!(to = %email.to, subject = %email.subject, "mail: {}", email.body);
        Ok(())
    }
}

fn lesson_line(reservation: &Reservation, subject: &str) -> String {
    format!(
        "{} {}-{} ({subject})",
        reservation.date,
        reservation.start_time.format("%H:%M"),
        reservation.end_time.format("%H:%M"),
    )
}

/// Confirmation sent to the student who made the reservation.
pub fn reservation_confirmation(student: &Profile, reservation: &Reservation, subject: &str) -> Email {
    let mut body = format!(
        "Hello {},\n\nYour lesson is confirmed: {}.\n",
        student.name,
        lesson_line(reservation, subject)
    );
    if !reservation.notes.is_empty() {
        body.push_str(&format!("Notes: {}\n", reservation.notes));
    }
    Email {
        to: student.email.clone(),
        subject: "Reservation confirmed".into(),
        body,
    }
}

/// Heads-up sent to the teacher whose shift was booked.
pub fn reservation_notice(teacher: &Profile, student: &Profile, shift: &Shift, reservation: &Reservation, subject: &str) -> Email {
    Email {
        to: teacher.email.clone(),
        subject: "New reservation".into(),
        body: format!(
            "Hello {},\n\n{} booked your shift {}: {}.\n",
            teacher.name,
            student.name,
            shift.id,
            lesson_line(reservation, subject)
        ),
    }
}

/// Send on a background task. Failures are logged and counted, never returned.
pub fn dispatch(notifier: Arc<dyn Notifier>, email: Email) {
    tokio::spawn(async move {
        let to = email.to.clone();
        match notifier.send(email).await {
            Ok(()) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "sent")
                    .increment(1);
            }
            Err(e) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "failed")
                    .increment(1);
                tracing::warn!("notification to {to} failed: {e}");
            }
        }
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use tokio::sync::Mutex;

    use super::*;

    /// Keeps every message it is handed.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<Email>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, email: Email) -> Result<(), NotifyError> {
            self.sent.lock().await.push(email);
            Ok(())
        }
    }

    pub struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(&self, _email: Email) -> Result<(), NotifyError> {
            Err(NotifyError::Unreachable("smtp down".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{NaiveDate, NaiveTime, Utc};
    use ulid::Ulid;

    use super::testing::*;
    use super::*;
    use crate::model::{ReservationStatus, Role};

    fn profile(name: &str, role: Role) -> Profile {
        let now = Utc::now();
        Profile {
            id: Ulid::new(),
            email: format!("{}@studio.test", name.to_lowercase()),
            name: name.into(),
            role,
            verified_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    fn reservation(notes: &str) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Ulid::new(),
            student_id: Ulid::new(),
            shift_id: Ulid::new(),
            subject_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            notes: notes.into(),
            status: ReservationStatus::Confirmed,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn confirmation_mentions_lesson_and_notes() {
        let student = profile("Alice", Role::Student);
        let email = reservation_confirmation(&student, &reservation("chapter 3"), "Math");
        assert_eq!(email.to, "alice@studio.test");
        assert!(email.body.contains("2024-06-01 09:00-10:00 (Math)"));
        assert!(email.body.contains("Notes: chapter 3"));

        let plain = reservation_confirmation(&student, &reservation(""), "Math");
        assert!(!plain.body.contains("Notes"));
    }

    #[tokio::test]
    async fn dispatch_delivers_in_background() {
        let recorder = Arc::new(RecordingNotifier::default());
        let email = Email {
            to: "sato@studio.test".into(),
            subject: "New reservation".into(),
            body: "hello".into(),
        };
        dispatch(recorder.clone(), email.clone());

        for _ in 0..50 {
            if !recorder.sent.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*recorder.sent.lock().await, vec![email]);
    }

    #[tokio::test]
    async fn dispatch_swallows_failures() {
        dispatch(
            Arc::new(FailingNotifier),
            Email {
                to: "x@studio.test".into(),
                subject: "s".into(),
                body: "b".into(),
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
