use std::sync::Arc;

use crate::error::BookingError;
use crate::model::Snapshot;
use crate::service::DataService;

/// Read-through mirror of the data service, owned by one session.
///
/// Never patched in place: after a mutation the whole snapshot is dropped
/// and fetched again.
#[derive(Debug, Default)]
pub struct StateCache {
    snapshot: Option<Arc<Snapshot>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self) {
        self.snapshot = None;
    }

    pub fn is_stale(&self) -> bool {
        self.snapshot.is_none()
    }

    /// Fetch a fresh snapshot. On failure the cache is left empty.
    pub async fn refresh<S: DataService + ?Sized>(
        &mut self,
        service: &S,
    ) -> Result<Arc<Snapshot>, BookingError> {
        self.snapshot = None;
        let snapshot = Arc::new(service.snapshot().await?);
        self.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// The cached snapshot, fetching one first if the cache is empty.
    pub async fn current<S: DataService + ?Sized>(
        &mut self,
        service: &S,
    ) -> Result<Arc<Snapshot>, BookingError> {
        match &self.snapshot {
            Some(snapshot) => Ok(snapshot.clone()),
            None => self.refresh(service).await,
        }
    }
}
