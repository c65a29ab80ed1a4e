use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Orders offer writes against refresh windows.
///
/// A scrape holds [`IngestGate::ingest`] from stamping `scraped_date` until the
/// insert returns. A refresh reads its window end under [`IngestGate::cutoff`],
/// so every offer stamped before that end is already committed and every
/// offer stamped afterwards falls into the next window.
#[derive(Debug, Clone, Default)]
pub struct IngestGate {
    lock: Arc<RwLock<()>>,
}

impl IngestGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ingest(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    pub async fn cutoff(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }
}
