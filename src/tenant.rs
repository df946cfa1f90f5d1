use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// Manages per-studio engines. Each studio gets its own Engine + WAL + compactor.
/// Studio = database name from the pgwire connection.
pub struct StudioManager {
    engines: DashMap<String, Arc<Engine>>,
    /// Studio slots handed out, including ones whose engine is still opening.
    opened: AtomicUsize,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl StudioManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            opened: AtomicUsize::new(0),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create the engine for the given studio.
    pub fn get_or_create(&self, studio: &str) -> std::io::Result<Arc<Engine>> {
        if studio.len() > MAX_STUDIO_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "studio name too long",
            ));
        }
        // Names that sanitize to the same file share one engine.
        let safe_name = sanitize(studio);
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty studio name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }

        // `engines.len()` would deadlock against the held entry, so the cap
        // is counted separately.
        let engine = match self.engines.entry(safe_name.clone()) {
            dashmap::Entry::Occupied(existing) => return Ok(existing.get().clone()),
            dashmap::Entry::Vacant(slot) => {
                self.opened
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < MAX_STUDIOS).then_some(n + 1)
                    })
                    .map_err(|_| std::io::Error::other("too many studios"))?;
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = match Engine::new(wal_path) {
                    Ok(engine) => Arc::new(engine),
                    Err(e) => {
                        self.opened.fetch_sub(1, Ordering::AcqRel);
                        return Err(e);
                    }
                };
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        metrics::gauge!(crate::observability::STUDIOS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("opened studio {safe_name}");
        Ok(engine)
    }

    pub fn studio_count(&self) -> usize {
        self.engines.len()
    }
}

/// Keep only characters that are safe in a file name.
fn sanitize(studio: &str) -> String {
    studio
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}
