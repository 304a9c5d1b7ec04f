//! Full rebuilds from a repository's `.files` tar archive.

use flate2::read::MultiGzDecoder;
use pacfile_core::parse::parse_block;
use pacfile_core::record::{split_package_dir, BlockKind, PackageRecord};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use xz2::read::XzDecoder;

use crate::store::RepoWriter;
use crate::sync::{SyncError, SyncReport, Synchronizer};

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Largest block read from an archive. Anything bigger is not package
/// metadata and is skipped without being read.
pub const MAX_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    /// Detects the compression from the first bytes of a file; anything
    /// unrecognised is read as a plain tar.
    pub fn from_magic_bytes(bytes: &[u8]) -> Compression {
        if bytes.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if bytes.starts_with(&XZ_MAGIC) {
            Compression::Xz
        } else if bytes.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// A tar archive of `<name>-<version>/<block>` entries.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    path: PathBuf,
}

impl ArchiveSource {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let metadata = std::fs::metadata(&path).map_err(|source| SyncError::Io {
            path: path.clone(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(SyncError::Archive {
                path,
                detail: "not a regular file".to_string(),
            });
        }
        Ok(ArchiveSource { path })
    }

    fn reader(&self) -> Result<Box<dyn Read>, SyncError> {
        let io_error = |source| SyncError::Io {
            path: self.path.clone(),
            source,
        };
        let file = File::open(&self.path).map_err(io_error)?;
        let mut reader = BufReader::new(file);
        let compression = Compression::from_magic_bytes(reader.fill_buf().map_err(io_error)?);
        debug!(path = %self.path.display(), %compression, "opening archive");
        Ok(match compression {
            Compression::None => Box::new(reader),
            Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
            Compression::Xz => Box::new(XzDecoder::new(reader)),
            Compression::Zstd => {
                Box::new(zstd::stream::read::Decoder::with_buffer(reader).map_err(io_error)?)
            }
        })
    }
}

impl Synchronizer for ArchiveSource {
    fn source(&self) -> String {
        self.path.display().to_string()
    }

    fn sync(&mut self, index: &mut RepoWriter) -> Result<SyncReport, SyncError> {
        rebuild_from_tar(index, self.reader()?, &self.path, MAX_BLOCK_SIZE)
    }
}

/// What one tar entry contributes to a rebuild.
enum TarEntry {
    Block(String, Vec<u8>),
    Ignored,
    Oversized,
}

/// Streams the tar in `reader` into [`rebuild_from_entries`]. Blocks larger
/// than `max_block_size` are skipped and counted in the report.
fn rebuild_from_tar<R: Read>(
    index: &mut RepoWriter,
    reader: R,
    path: &Path,
    max_block_size: u64,
) -> Result<SyncReport, SyncError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|err| SyncError::Archive {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    let mut oversized = 0;
    let blocks = entries.filter_map(|entry| match read_entry(entry, path, max_block_size) {
        Ok(TarEntry::Block(name, bytes)) => Some(Ok((name, bytes))),
        Ok(TarEntry::Ignored) => None,
        Ok(TarEntry::Oversized) => {
            oversized += 1;
            None
        }
        Err(err) => Some(Err(err)),
    });
    let mut report = rebuild_from_entries(index, blocks)?;
    report.skipped += oversized;
    Ok(report)
}

fn read_entry<R: Read>(
    entry: std::io::Result<tar::Entry<'_, R>>,
    archive: &Path,
    max_block_size: u64,
) -> Result<TarEntry, SyncError> {
    let archive_error = |err: std::io::Error| SyncError::Archive {
        path: archive.to_path_buf(),
        detail: err.to_string(),
    };
    let mut entry = entry.map_err(archive_error)?;
    if !entry.header().entry_type().is_file() {
        return Ok(TarEntry::Ignored);
    }
    let name = entry.path().map_err(archive_error)?.to_string_lossy().into_owned();
    if entry.size() > max_block_size {
        warn!(entry = %name, size = entry.size(), "skipping oversized archive entry");
        return Ok(TarEntry::Oversized);
    }
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).map_err(archive_error)?;
    Ok(TarEntry::Block(name, bytes))
}

/// Replaces the index content with the packages found in `entries`.
///
/// Entries are `(path, contents)` pairs in archive order. Blocks for one
/// package are merged into a single record before it is written; a package
/// directory that reappears later in the stream is merged onto what was
/// already written. Counts are relative to the index content before the
/// rebuild.
pub fn rebuild_from_entries<I>(index: &mut RepoWriter, entries: I) -> Result<SyncReport, SyncError>
where
    I: IntoIterator<Item = Result<(String, Vec<u8>), SyncError>>,
{
    let previous = index.versions()?;
    let cleared = index.clear()?;
    debug!(repository = index.name(), cleared, "cleared index for rebuild");

    let mut report = SyncReport::default();
    let mut written = HashSet::new();
    let mut rejected = HashSet::new();
    let mut pending: Option<(String, PackageRecord)> = None;

    for entry in entries {
        let (path, bytes) = entry?;
        let Some((dir, block)) = split_entry_path(&path) else {
            debug!(entry = %path, "ignoring entry outside a package directory");
            continue;
        };
        let Some(kind) = BlockKind::from_file_name(block) else {
            debug!(entry = %path, "ignoring unknown block");
            continue;
        };

        if pending.as_ref().map(|(current, _)| current.as_str()) != Some(dir) {
            if let Some((_, record)) = pending.take() {
                flush(index, record, &previous, &mut written, &mut report)?;
            }
            let Some((name, version)) = split_package_dir(dir) else {
                if rejected.insert(dir.to_string()) {
                    warn!(entry = %dir, "skipping entry that is not <name>-<version>");
                    report.skipped += 1;
                }
                continue;
            };
            let record = if written.contains(&name) {
                match index.get(&name)? {
                    Some(stored) if stored.version == version => stored,
                    _ => PackageRecord::new(name, version),
                }
            } else {
                PackageRecord::new(name, version)
            };
            pending = Some((dir.to_string(), record));
        }

        if let Some((_, record)) = pending.as_mut() {
            debug!(package = %record.name, block = kind.file_name(), "reading block");
            record.apply(parse_block(&String::from_utf8_lossy(&bytes)));
        }
    }
    if let Some((_, record)) = pending.take() {
        flush(index, record, &previous, &mut written, &mut report)?;
    }

    report.removed = previous
        .keys()
        .filter(|name| !written.contains(*name))
        .count();
    Ok(report)
}

fn flush(
    index: &mut RepoWriter,
    record: PackageRecord,
    previous: &BTreeMap<String, String>,
    written: &mut HashSet<String>,
    report: &mut SyncReport,
) -> Result<(), SyncError> {
    index.upsert(&record)?;
    if written.insert(record.name.clone()) {
        match previous.get(&record.name) {
            None => report.added += 1,
            Some(version) if *version == record.version => report.unchanged += 1,
            Some(_) => report.updated += 1,
        }
    }
    Ok(())
}

/// Splits `<dir>/<block>` into its two final components.
fn split_entry_path(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches("./").trim_end_matches('/');
    let (parent, block) = path.rsplit_once('/')?;
    let dir = parent.rsplit('/').next()?;
    if dir.is_empty() || block.is_empty() {
        return None;
    }
    Some((dir, block))
}
