//! The data-service seam between a client session and the authoritative store.

use async_trait::async_trait;
use ulid::Ulid;

use crate::engine::Engine;
use crate::error::BookingError;
use crate::model::*;

/// CRUD over the four collections, as a session sees it.
///
/// Every call is a suspending round trip. An unreachable service surfaces as
/// `BookingError::RemoteUnavailable`.
#[async_trait]
pub trait DataService: Send + Sync {
    async fn snapshot(&self) -> Result<Snapshot, BookingError>;

    async fn find_profile_by_email(&self, email: &str) -> Result<Option<Profile>, BookingError>;

    async fn register_profile(&self, actor: &Principal, new: NewProfile) -> Result<Profile, BookingError>;

    async fn verify_profile(&self, actor: &Principal, id: Ulid) -> Result<Profile, BookingError>;

    async fn create_subject(&self, actor: &Principal, id: Ulid, name: String) -> Result<Subject, BookingError>;

    async fn create_shift(&self, actor: &Principal, new: NewShift) -> Result<Shift, BookingError>;

    async fn update_shift(
        &self,
        actor: &Principal,
        id: Ulid,
        changes: ShiftChanges,
    ) -> Result<Shift, BookingError>;

    async fn delete_shift(&self, actor: &Principal, id: Ulid) -> Result<(), BookingError>;

    async fn create_reservation(
        &self,
        actor: &Principal,
        new: NewReservation,
    ) -> Result<Reservation, BookingError>;

    async fn transition_reservation(
        &self,
        actor: &Principal,
        id: Ulid,
        to: ReservationStatus,
    ) -> Result<Reservation, BookingError>;
}

#[async_trait]
impl DataService for Engine {
    async fn snapshot(&self) -> Result<Snapshot, BookingError> {
        Ok(Engine::snapshot(self).await)
    }

    async fn find_profile_by_email(&self, email: &str) -> Result<Option<Profile>, BookingError> {
        Ok(Engine::find_profile_by_email(self, email))
    }

    async fn register_profile(&self, actor: &Principal, new: NewProfile) -> Result<Profile, BookingError> {
        Engine::register_profile(self, actor, new).await
    }

    async fn verify_profile(&self, actor: &Principal, id: Ulid) -> Result<Profile, BookingError> {
        Engine::verify_profile(self, actor, id).await
    }

    async fn create_subject(&self, actor: &Principal, id: Ulid, name: String) -> Result<Subject, BookingError> {
        Engine::create_subject(self, actor, id, name).await
    }

    async fn create_shift(&self, actor: &Principal, new: NewShift) -> Result<Shift, BookingError> {
        Engine::create_shift(self, actor, new).await
    }

    async fn update_shift(
        &self,
        actor: &Principal,
        id: Ulid,
        changes: ShiftChanges,
    ) -> Result<Shift, BookingError> {
        Engine::update_shift(self, actor, id, changes).await
    }

    async fn delete_shift(&self, actor: &Principal, id: Ulid) -> Result<(), BookingError> {
        Engine::delete_shift(self, actor, id).await
    }

    async fn create_reservation(
        &self,
        actor: &Principal,
        new: NewReservation,
    ) -> Result<Reservation, BookingError> {
        Engine::create_reservation(self, actor, new).await
    }

    async fn transition_reservation(
        &self,
        actor: &Principal,
        id: Ulid,
        to: ReservationStatus,
    ) -> Result<Reservation, BookingError> {
        Engine::transition_reservation(self, actor, id, to).await
    }
}
