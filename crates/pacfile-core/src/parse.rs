use chrono::{DateTime, Utc};
use std::str::Lines;
use tracing::debug;

use crate::record::{BackupFile, InstallReason};

/// Fields recovered from one metadata block.
///
/// List fields are `Some` whenever their section was present, even if it was
/// empty, so that merging can tell "cleared" apart from "not mentioned".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFragment {
    pub name: Option<String>,
    pub version: Option<String>,
    pub filename: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub packager: Option<String>,
    pub architecture: Option<String>,
    pub build_date: Option<DateTime<Utc>>,
    pub install_date: Option<DateTime<Utc>>,
    pub installed_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub md5sum: Option<String>,
    pub sha256sum: Option<String>,
    pub reason: Option<InstallReason>,
    pub license: Option<Vec<String>>,
    pub groups: Option<Vec<String>>,
    pub replaces: Option<Vec<String>>,
    pub depends: Option<Vec<String>>,
    pub optional_depends: Option<Vec<String>>,
    pub conflicts: Option<Vec<String>>,
    pub provides: Option<Vec<String>>,
    pub files: Option<Vec<String>>,
    pub backup: Option<Vec<BackupFile>>,
}

impl RecordFragment {
    pub fn is_empty(&self) -> bool {
        self == &RecordFragment::default()
    }
}

/// Parses a `%TAG%`-sectioned metadata block.
///
/// Never fails: unknown sections are skipped and values that do not parse
/// are left unset.
pub fn parse_block(content: &str) -> RecordFragment {
    let mut fragment = RecordFragment::default();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        let Some(tag) = section_tag(line) else {
            continue;
        };
        match tag {
            "NAME" => fragment.name = single_value(&mut lines),
            "VERSION" => fragment.version = single_value(&mut lines),
            "FILENAME" => fragment.filename = single_value(&mut lines),
            "DESC" => fragment.description = single_value(&mut lines),
            "URL" => fragment.url = single_value(&mut lines),
            "ARCH" => fragment.architecture = single_value(&mut lines),
            "PACKAGER" => fragment.packager = single_value(&mut lines),
            "MD5SUM" => fragment.md5sum = single_value(&mut lines),
            "SHA256SUM" => fragment.sha256sum = single_value(&mut lines),
            "BUILDDATE" => {
                fragment.build_date = single_value(&mut lines).and_then(|v| timestamp(tag, &v))
            }
            "INSTALLDATE" => {
                fragment.install_date = single_value(&mut lines).and_then(|v| timestamp(tag, &v))
            }
            "SIZE" | "ISIZE" => {
                fragment.installed_size = single_value(&mut lines).and_then(|v| size(tag, &v))
            }
            "CSIZE" => {
                fragment.compressed_size = single_value(&mut lines).and_then(|v| size(tag, &v))
            }
            "REASON" => {
                fragment.reason = single_value(&mut lines).and_then(|v| {
                    let reason = InstallReason::from_code(&v);
                    if reason.is_none() {
                        debug!(tag, value = %v, "unrecognised install reason");
                    }
                    reason
                })
            }
            "GROUPS" => fragment.groups = Some(section_values(&mut lines)),
            "LICENSE" => fragment.license = Some(section_values(&mut lines)),
            "REPLACES" => fragment.replaces = Some(section_values(&mut lines)),
            "DEPENDS" => fragment.depends = Some(section_values(&mut lines)),
            "OPTDEPENDS" => fragment.optional_depends = Some(section_values(&mut lines)),
            "CONFLICTS" => fragment.conflicts = Some(section_values(&mut lines)),
            "PROVIDES" => fragment.provides = Some(section_values(&mut lines)),
            "FILES" => fragment.files = Some(section_values(&mut lines)),
            "BACKUP" => {
                fragment.backup = Some(
                    section_values(&mut lines)
                        .into_iter()
                        .map(|line| backup_entry(&line))
                        .collect(),
                )
            }
            other => {
                debug!(tag = other, "skipping unknown section");
                section_values(&mut lines);
            }
        }
    }

    fragment
}

fn section_tag(line: &str) -> Option<&str> {
    let tag = line.strip_prefix('%')?.strip_suffix('%')?;
    if tag.is_empty()
        || !tag
            .chars()
            .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_')
    {
        return None;
    }
    Some(tag)
}

fn single_value(lines: &mut Lines<'_>) -> Option<String> {
    lines
        .next()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
}

fn section_values(lines: &mut Lines<'_>) -> Vec<String> {
    lines
        .take_while(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn timestamp(tag: &str, value: &str) -> Option<DateTime<Utc>> {
    let parsed = value
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    if parsed.is_none() {
        debug!(tag, value, "unparseable timestamp");
    }
    parsed
}

fn size(tag: &str, value: &str) -> Option<u64> {
    let parsed = value.trim().parse::<u64>().ok();
    if parsed.is_none() {
        debug!(tag, value, "unparseable size");
    }
    parsed
}

fn backup_entry(line: &str) -> BackupFile {
    match line.split_once('\t') {
        Some((path, hash)) => BackupFile {
            path: path.to_string(),
            hash: hash.to_string(),
        },
        None => BackupFile {
            path: line.to_string(),
            hash: String::new(),
        },
    }
}
