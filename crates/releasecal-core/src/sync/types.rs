//! Shared types for the sync pipeline.

use serde::{Deserialize, Serialize};

/// What happened to one release during a sync call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// An external event was created (or adopted via fingerprint lookup).
    Created,
    /// The existing external event was refreshed.
    Updated,
    /// The external event was removed and the state tombstoned.
    Deleted,
    /// The release ended the call in `failed` (or kept its previous status
    /// after a failed update/delete).
    Failed,
    /// Nothing to do for this release.
    Skipped,
    /// Shutdown was observed before the outcome was known; state unchanged.
    Cancelled,
}

/// Aggregated result of one scheduler cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CycleSummary {
    pub fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Created => self.created += 1,
            SyncOutcome::Updated => self.updated += 1,
            SyncOutcome::Deleted => self.deleted += 1,
            SyncOutcome::Failed => self.failed += 1,
            SyncOutcome::Skipped | SyncOutcome::Cancelled => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted + self.failed + self.skipped
    }
}

impl std::fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "created {}, updated {}, deleted {}, failed {}, skipped {}",
            self.created, self.updated, self.deleted, self.failed, self.skipped
        )
    }
}
