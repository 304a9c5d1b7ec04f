use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

use crate::parse::RecordFragment;

/// Name of the pseudo-repository holding the installed package set.
pub const LOCAL_REPOSITORY: &str = "local";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstallReason {
    Explicit,
    Dependency,
}

impl InstallReason {
    pub fn from_code(code: &str) -> Option<InstallReason> {
        match code.trim() {
            "0" => Some(InstallReason::Explicit),
            "1" => Some(InstallReason::Dependency),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallReason::Explicit => "explicit",
            InstallReason::Dependency => "dependency",
        }
    }

    pub fn from_label(value: &str) -> Option<InstallReason> {
        match value {
            "explicit" => Some(InstallReason::Explicit),
            "dependency" => Some(InstallReason::Dependency),
            _ => None,
        }
    }
}

impl fmt::Display for InstallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupFile {
    pub path: String,
    pub hash: String,
}

/// One package as stored in a repository index.
///
/// Only `name` and `version` are guaranteed; everything else is filled in
/// from whichever metadata blocks were present when the package was parsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub license: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub replaces: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub optional_depends: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub files: BTreeSet<String>,
    #[serde(default)]
    pub backup: Vec<BackupFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<InstallReason>,
}

impl PackageRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        PackageRecord {
            name: name.into(),
            version: version.into(),
            filename: None,
            description: None,
            url: None,
            packager: None,
            architecture: None,
            build_date: None,
            install_date: None,
            installed_size: None,
            compressed_size: None,
            checksum: None,
            license: Vec::new(),
            groups: Vec::new(),
            replaces: Vec::new(),
            depends: Vec::new(),
            optional_depends: Vec::new(),
            conflicts: Vec::new(),
            provides: Vec::new(),
            files: BTreeSet::new(),
            backup: Vec::new(),
            reason: None,
        }
    }

    /// Merges a parsed block into this record.
    ///
    /// Fields the fragment carries overwrite the current value, fields it
    /// lacks are left alone. The record's identity never changes: a block
    /// naming a different package or version is logged and its identity
    /// fields are dropped.
    pub fn apply(&mut self, fragment: RecordFragment) {
        if let Some(name) = fragment.name.filter(|name| name != &self.name) {
            debug!(package = %self.name, block_name = %name, "block name differs from entry");
        }
        if let Some(version) = fragment.version.filter(|version| version != &self.version) {
            debug!(
                package = %self.name,
                version = %self.version,
                block_version = %version,
                "block version differs from entry"
            );
        }

        overwrite(&mut self.filename, fragment.filename);
        overwrite(&mut self.description, fragment.description);
        overwrite(&mut self.url, fragment.url);
        overwrite(&mut self.packager, fragment.packager);
        overwrite(&mut self.architecture, fragment.architecture);
        overwrite(&mut self.build_date, fragment.build_date);
        overwrite(&mut self.install_date, fragment.install_date);
        overwrite(&mut self.installed_size, fragment.installed_size);
        overwrite(&mut self.compressed_size, fragment.compressed_size);
        overwrite(&mut self.checksum, fragment.sha256sum.or(fragment.md5sum));
        overwrite(&mut self.reason, fragment.reason);

        replace_list(&mut self.license, fragment.license);
        replace_list(&mut self.groups, fragment.groups);
        replace_list(&mut self.replaces, fragment.replaces);
        replace_list(&mut self.depends, fragment.depends);
        replace_list(&mut self.optional_depends, fragment.optional_depends);
        replace_list(&mut self.conflicts, fragment.conflicts);
        replace_list(&mut self.provides, fragment.provides);
        replace_list(&mut self.backup, fragment.backup);
        if let Some(files) = fragment.files {
            self.files = files.into_iter().collect();
        }
    }
}

fn overwrite<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn replace_list<T>(slot: &mut Vec<T>, value: Option<Vec<T>>) {
    if let Some(value) = value {
        *slot = value;
    }
}

/// The per-package metadata files a repository feed carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Description,
    Dependency,
    FileList,
}

impl BlockKind {
    pub const ALL: [BlockKind; 3] = [
        BlockKind::Description,
        BlockKind::Dependency,
        BlockKind::FileList,
    ];

    pub fn from_file_name(name: &str) -> Option<BlockKind> {
        match name {
            "desc" => Some(BlockKind::Description),
            "depends" => Some(BlockKind::Dependency),
            "files" => Some(BlockKind::FileList),
            _ => None,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            BlockKind::Description => "desc",
            BlockKind::Dependency => "depends",
            BlockKind::FileList => "files",
        }
    }
}

/// Splits a `name-version-release` directory name into name and version.
///
/// The last two dash-separated segments are always taken as the version,
/// so names that end in something version-like are misread
/// (`a-b-1-2` and a package `a` at `b-1-2` are indistinguishable).
pub fn split_package_dir(dir: &str) -> Option<(String, String)> {
    let mut parts = dir.rsplitn(3, '-');
    let release = parts.next()?;
    let version = parts.next()?;
    let name = parts.next()?;
    if name.is_empty() || version.is_empty() || release.is_empty() {
        return None;
    }
    Some((name.to_string(), format!("{}-{}", version, release)))
}
