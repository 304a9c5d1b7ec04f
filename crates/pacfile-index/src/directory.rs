//! Incremental sync from a directory of unpacked package entries, such as
//! the package manager's database of installed packages.

use pacfile_core::parse::parse_block;
use pacfile_core::record::{split_package_dir, BlockKind, PackageRecord};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::store::RepoWriter;
use crate::sync::{SyncError, SyncReport, Synchronizer};

/// Package directories named `<name>-<version>`, each holding optional
/// `desc`, `depends` and `files` blocks.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectorySource { root: root.into() }
    }

    fn package_dirs(&self) -> Result<Vec<(String, PathBuf)>, SyncError> {
        let io_error = |source| SyncError::Io {
            path: self.root.clone(),
            source,
        };
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(io_error)? {
            let entry = entry.map_err(io_error)?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => dirs.push((name, path)),
                Err(name) => {
                    warn!(entry = ?name, "skipping package directory with a non-utf8 name");
                }
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

impl Synchronizer for DirectorySource {
    fn source(&self) -> String {
        self.root.display().to_string()
    }

    fn sync(&mut self, index: &mut RepoWriter) -> Result<SyncReport, SyncError> {
        let stored = index.versions()?;
        let mut report = SyncReport::default();
        let mut seen = HashSet::new();

        for (dir_name, path) in self.package_dirs()? {
            let Some((name, version)) = split_package_dir(&dir_name) else {
                warn!(entry = %dir_name, "skipping entry that is not <name>-<version>");
                report.skipped += 1;
                continue;
            };
            if !seen.insert(name.clone()) {
                warn!(package = %name, entry = %dir_name, "duplicate package directory");
            }

            let previous = stored.get(&name);
            if previous == Some(&version) {
                report.unchanged += 1;
                continue;
            }

            let record = match read_package(&path, &name, &version) {
                Ok(record) => record,
                Err(err) => {
                    warn!(entry = %dir_name, error = %err, "skipping unreadable package");
                    report.skipped += 1;
                    continue;
                }
            };
            index.upsert(&record)?;
            debug!(package = %name, version = %version, files = record.files.len(), "indexed package");
            if previous.is_some() {
                report.updated += 1;
            } else {
                report.added += 1;
            }
        }

        for name in stored.keys().filter(|name| !seen.contains(*name)) {
            if index.delete(name)? {
                debug!(package = %name, "pruned package");
                report.removed += 1;
            }
        }
        Ok(report)
    }
}

fn read_package(dir: &Path, name: &str, version: &str) -> std::io::Result<PackageRecord> {
    let mut record = PackageRecord::new(name, version);
    for kind in BlockKind::ALL {
        let path = dir.join(kind.file_name());
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        let fragment = parse_block(&String::from_utf8_lossy(&bytes));
        if fragment.is_empty() {
            debug!(path = %path.display(), "block has no recognised sections");
        }
        record.apply(fragment);
    }
    Ok(record)
}
