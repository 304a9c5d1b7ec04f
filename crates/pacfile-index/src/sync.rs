use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, instrument};

use crate::store::{PackageStore, RepoWriter, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read archive {path}: {detail}")]
    Archive { path: PathBuf, detail: String },
}

/// What one sync pass did to a repository index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl SyncReport {
    pub fn changed(&self) -> usize {
        self.added + self.updated + self.removed
    }
}

/// A source of package metadata that can bring an index up to date.
pub trait Synchronizer {
    /// Where the packages come from, recorded in the index meta.
    fn source(&self) -> String;

    fn sync(&mut self, index: &mut RepoWriter) -> Result<SyncReport, SyncError>;
}

/// Runs one sync pass for `repository` while holding its write lock.
#[instrument(skip(store, synchronizer), fields(source = %synchronizer.source()))]
pub fn sync_repository<S>(
    store: &PackageStore,
    repository: &str,
    synchronizer: &mut S,
) -> Result<SyncReport, SyncError>
where
    S: Synchronizer + ?Sized,
{
    let mut index = store.open_writer(repository)?;
    let report = synchronizer.sync(&mut index)?;

    let package_count = index.len()?;
    index.set_meta("source", &synchronizer.source())?;
    index.set_meta("synced_at", &Utc::now().to_rfc3339())?;
    index.set_meta("package_count", &package_count.to_string())?;

    info!(
        repository,
        changed = report.changed(),
        added = report.added,
        updated = report.updated,
        removed = report.removed,
        unchanged = report.unchanged,
        skipped = report.skipped,
        "repository synced"
    );
    Ok(report)
}
