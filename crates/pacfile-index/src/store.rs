//! Persistent per-repository package indexes.
//!
//! Every repository lives in its own SQLite database inside the store
//! directory (`<dir>/<repository>.db`), so repositories never contend with
//! each other. Each mutating call commits its own transaction before it
//! returns. Mutations are only reachable through a [`RepoWriter`], which owns
//! the [`WriteLock`] on `<dir>/<repository>.lock` for as long as it lives;
//! readers get a [`RepoIndex`], rely on WAL and take no lock.

use chrono::DateTime;
use fs4::FileExt;
use indexmap::IndexMap;
use pacfile_core::matcher::Matcher;
use pacfile_core::record::{BackupFile, InstallReason, PackageRecord};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::schema::{EXPECTED_TABLES, SCHEMA, SCHEMA_VERSION};

const DB_EXTENSION: &str = "db";
const LOCK_EXTENSION: &str = "lock";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("repository {repository}: database error: {source}")]
    Sqlite {
        repository: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("index io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("repository {repository}: index is corrupted: {detail}")]
    Corrupt { repository: String, detail: String },
    #[error("repository {0} has not been synced yet")]
    Missing(String),
    #[error("invalid repository name: {0:?}")]
    InvalidName(String),
    #[error("repository {repository}: failed to lock {path}: {source}")]
    Lock {
        repository: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn sqlite(repository: &str, source: rusqlite::Error) -> StoreError {
        StoreError::Sqlite {
            repository: repository.to_string(),
            source,
        }
    }

    /// The repository the error concerns, when it is known.
    pub fn repository(&self) -> Option<&str> {
        match self {
            StoreError::Sqlite { repository, .. }
            | StoreError::Corrupt { repository, .. }
            | StoreError::Lock { repository, .. } => Some(repository),
            StoreError::Missing(repository) | StoreError::InvalidName(repository) => {
                Some(repository)
            }
            StoreError::Io { .. } => None,
        }
    }
}

/// How a scan selects rows.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    All,
    Exact(&'a str),
    Matching(&'a Matcher),
}

/// A file row with its owning package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHit {
    pub package: String,
    pub version: String,
    pub path: String,
}

/// The directory holding every repository index.
#[derive(Debug, Clone)]
pub struct PackageStore {
    dir: PathBuf,
}

impl PackageStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(PackageStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names of every repository with an index, sorted.
    pub fn repositories(&self) -> Result<Vec<String>, StoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(DB_EXTENSION) {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                if validate_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn contains(&self, repository: &str) -> bool {
        validate_name(repository).is_ok() && self.db_path(repository).is_file()
    }

    /// Opens an existing repository index for querying. The handle has no
    /// mutating operations.
    pub fn open_reader(&self, repository: &str) -> Result<RepoIndex, StoreError> {
        validate_name(repository)?;
        let path = self.db_path(repository);
        if !path.is_file() {
            return Err(StoreError::Missing(repository.to_string()));
        }
        RepoIndex::open(repository, &path)
    }

    /// Takes the repository's write lock, then opens (or creates) its index.
    ///
    /// Blocks while another writer holds the lock.
    pub fn open_writer(&self, repository: &str) -> Result<RepoWriter, StoreError> {
        validate_name(repository)?;
        let lock = WriteLock::acquire(repository, self.lock_path(repository))?;
        let index = RepoIndex::open(repository, &self.db_path(repository))?;
        Ok(RepoWriter {
            index,
            _lock: Some(lock),
        })
    }

    /// Deletes a repository index. Returns false if there was none.
    ///
    /// The lock file stays behind: a writer blocked on it must keep
    /// contending with the writers that come after the removal.
    pub fn remove(&self, repository: &str) -> Result<bool, StoreError> {
        validate_name(repository)?;
        let db_path = self.db_path(repository);
        if !db_path.exists() {
            return Ok(false);
        }
        let _lock = WriteLock::acquire(repository, self.lock_path(repository))?;
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Io { path, source }),
            }
        }
        info!(repository, "removed repository index");
        Ok(true)
    }

    fn db_path(&self, repository: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", repository, DB_EXTENSION))
    }

    fn lock_path(&self, repository: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", repository, LOCK_EXTENSION))
    }
}

/// Checks that `name` can be used as a repository index file name.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '+' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Exclusive advisory lock serialising writers of one repository.
///
/// Released when dropped.
#[derive(Debug)]
pub struct WriteLock {
    _file: File,
}

impl WriteLock {
    fn acquire(repository: &str, path: PathBuf) -> Result<Self, StoreError> {
        let lock_error = |source| StoreError::Lock {
            repository: repository.to_string(),
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(lock_error)?;
        file.lock_exclusive().map_err(lock_error)?;
        debug!(repository, path = %path.display(), "acquired write lock");
        Ok(WriteLock { _file: file })
    }
}

/// One repository's index, read-only.
#[derive(Debug)]
pub struct RepoIndex {
    name: String,
    conn: Connection,
}

impl RepoIndex {
    /// Opens or creates the index at `path`, checking its integrity first.
    fn open(repository: &str, path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| open_error(repository, source))?;
        let mut index = RepoIndex {
            name: repository.to_string(),
            conn,
        };
        index.prepare()?;
        Ok(index)
    }

    #[cfg(test)]
    fn open_in_memory(repository: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| open_error(repository, source))?;
        let mut index = RepoIndex {
            name: repository.to_string(),
            conn,
        };
        index.prepare()?;
        Ok(index)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self) -> Result<(), StoreError> {
        let repository = self.name.clone();
        let repository = repository.as_str();
        let conn = &self.conn;
        conn.busy_timeout(Duration::from_secs(10))
            .map_err(|source| open_error(repository, source))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|source| open_error(repository, source))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|source| open_error(repository, source))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|source| open_error(repository, source))?;

        run_integrity_check(conn).map_err(|err| match err {
            IntegrityError::Sqlite(source) => open_error(repository, source),
            IntegrityError::Failed(detail) => StoreError::Corrupt {
                repository: repository.to_string(),
                detail,
            },
        })?;

        let tables = existing_tables(conn).map_err(|source| open_error(repository, source))?;
        let version = stored_schema_version(conn, &tables)
            .map_err(|source| open_error(repository, source))?;
        if version.is_none() {
            self.initialise()?;
        }
        self.check_schema()
    }

    /// Creates the schema and stamps its version in one transaction, so no
    /// other connection ever sees a half-initialised file. A file left with
    /// the tables but no version and no data is stamped as well.
    fn initialise(&mut self) -> Result<(), StoreError> {
        let repository = self.name.clone();
        let sqlite = |source: rusqlite::Error| StoreError::sqlite(&repository, source);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sqlite)?;
        let tables = existing_tables(&tx).map_err(sqlite)?;
        if tables.is_empty() {
            tx.execute_batch(SCHEMA).map_err(sqlite)?;
            stamp_schema_version(&tx).map_err(sqlite)?;
            debug!(repository = %repository, "initialised repository index");
        } else if is_unstamped_and_empty(&tx, &tables).map_err(sqlite)? {
            stamp_schema_version(&tx).map_err(sqlite)?;
            warn!(repository = %repository, "completed an interrupted index initialisation");
        }
        tx.commit().map_err(sqlite)
    }

    fn check_schema(&self) -> Result<(), StoreError> {
        let repository = self.name.as_str();
        let tables =
            existing_tables(&self.conn).map_err(|source| open_error(repository, source))?;
        let missing: Vec<&str> = EXPECTED_TABLES
            .iter()
            .copied()
            .filter(|table| !tables.contains(*table))
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::Corrupt {
                repository: repository.to_string(),
                detail: format!("missing tables: {}", missing.join(", ")),
            });
        }
        let version = self.meta_value("schema_version")?;
        if version.as_deref() != Some(SCHEMA_VERSION.to_string().as_str()) {
            return Err(StoreError::Corrupt {
                repository: repository.to_string(),
                detail: format!(
                    "schema version {}, expected {}",
                    version.as_deref().unwrap_or("missing"),
                    SCHEMA_VERSION
                ),
            });
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<PackageRecord>, StoreError> {
        load_record(&self.conn, name).map_err(|source| StoreError::sqlite(&self.name, source))
    }

    /// Records whose name satisfies `lookup`, ordered by name.
    pub fn scan(&self, lookup: &Lookup<'_>) -> Result<Vec<PackageRecord>, StoreError> {
        scan_records(&self.conn, lookup).map_err(|source| StoreError::sqlite(&self.name, source))
    }

    /// File rows whose absolute form (`/` + stored path) satisfies `lookup`,
    /// ordered by package then path.
    pub fn scan_files(&self, lookup: &Lookup<'_>) -> Result<Vec<FileHit>, StoreError> {
        scan_file_rows(&self.conn, lookup).map_err(|source| StoreError::sqlite(&self.name, source))
    }

    /// Stored version of every package.
    pub fn versions(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let result: rusqlite::Result<BTreeMap<String, String>> = (|| {
            let mut stmt = self.conn.prepare("SELECT name, version FROM packages")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })();
        result.map_err(|source| StoreError::sqlite(&self.name, source))
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM packages", [], |row| row.get::<_, i64>(0))
            .map(|count| count as usize)
            .map_err(|source| StoreError::sqlite(&self.name, source))
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn meta_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|source| StoreError::sqlite(&self.name, source))
    }

    /// Every meta entry, ordered by key.
    pub fn meta(&self) -> Result<IndexMap<String, String>, StoreError> {
        let result: rusqlite::Result<IndexMap<String, String>> = (|| {
            let mut stmt = self.conn.prepare("SELECT key, value FROM meta ORDER BY key")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })();
        result.map_err(|source| StoreError::sqlite(&self.name, source))
    }
}

/// A repository index opened for writing.
///
/// Owns the repository's [`WriteLock`] until dropped. Reads go through
/// [`RepoIndex`] via `Deref`.
#[derive(Debug)]
pub struct RepoWriter {
    index: RepoIndex,
    _lock: Option<WriteLock>,
}

impl Deref for RepoWriter {
    type Target = RepoIndex;

    fn deref(&self) -> &RepoIndex {
        &self.index
    }
}

impl RepoWriter {
    /// Inserts the record, replacing any stored package of the same name
    /// together with its whole file list.
    pub fn upsert(&mut self, record: &PackageRecord) -> Result<(), StoreError> {
        let index = &mut self.index;
        write_record(&mut index.conn, record)
            .map_err(|source| StoreError::sqlite(&index.name, source))
    }

    pub fn delete(&mut self, name: &str) -> Result<bool, StoreError> {
        let index = &mut self.index;
        delete_record(&mut index.conn, name)
            .map_err(|source| StoreError::sqlite(&index.name, source))
    }

    /// Removes every package; returns how many there were.
    pub fn clear(&mut self) -> Result<usize, StoreError> {
        let index = &mut self.index;
        clear_records(&mut index.conn).map_err(|source| StoreError::sqlite(&index.name, source))
    }

    pub fn set_meta(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let index = &self.index;
        index
            .conn
            .execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|_| ())
            .map_err(|source| StoreError::sqlite(&index.name, source))
    }
}

#[cfg(test)]
impl RepoWriter {
    /// An unlocked writer over a private in-memory database.
    pub(crate) fn open_in_memory(repository: &str) -> Result<Self, StoreError> {
        Ok(RepoWriter {
            index: RepoIndex::open_in_memory(repository)?,
            _lock: None,
        })
    }

    pub(crate) fn into_index(self) -> RepoIndex {
        self.index
    }
}

fn open_error(repository: &str, source: rusqlite::Error) -> StoreError {
    match source.sqlite_error_code() {
        Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => StoreError::Corrupt {
            repository: repository.to_string(),
            detail: source.to_string(),
        },
        _ => StoreError::sqlite(repository, source),
    }
}

enum IntegrityError {
    Sqlite(rusqlite::Error),
    Failed(String),
}

fn run_integrity_check(conn: &Connection) -> Result<(), IntegrityError> {
    let mut stmt = conn
        .prepare("PRAGMA integrity_check")
        .map_err(IntegrityError::Sqlite)?;
    let mut rows = stmt.query([]).map_err(IntegrityError::Sqlite)?;
    while let Some(row) = rows.next().map_err(IntegrityError::Sqlite)? {
        let result: String = row.get(0).map_err(IntegrityError::Sqlite)?;
        if !result.eq_ignore_ascii_case("ok") {
            return Err(IntegrityError::Failed(result));
        }
    }
    Ok(())
}

fn existing_tables(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}

fn stored_schema_version(
    conn: &Connection,
    tables: &HashSet<String>,
) -> rusqlite::Result<Option<String>> {
    if !tables.contains("meta") {
        return Ok(None);
    }
    conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )
    .optional()
}

fn stamp_schema_version(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )
    .map(|_| ())
}

fn is_unstamped_and_empty(conn: &Connection, tables: &HashSet<String>) -> rusqlite::Result<bool> {
    if !EXPECTED_TABLES.iter().all(|table| tables.contains(*table)) {
        return Ok(false);
    }
    for table in EXPECTED_TABLES {
        let rows: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        if rows > 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

const RECORD_COLUMNS: &str = "id, name, version, filename, description, url, packager, \
    architecture, build_date, install_date, installed_size, compressed_size, checksum, reason, \
    license, groups, replaces, depends, optional_depends, conflicts, provides, backup";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, PackageRecord)> {
    let mut record = PackageRecord::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?);
    record.filename = row.get(3)?;
    record.description = row.get(4)?;
    record.url = row.get(5)?;
    record.packager = row.get(6)?;
    record.architecture = row.get(7)?;
    record.build_date = row
        .get::<_, Option<i64>>(8)?
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    record.install_date = row
        .get::<_, Option<i64>>(9)?
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    record.installed_size = row
        .get::<_, Option<i64>>(10)?
        .and_then(|size| u64::try_from(size).ok());
    record.compressed_size = row
        .get::<_, Option<i64>>(11)?
        .and_then(|size| u64::try_from(size).ok());
    record.checksum = row.get(12)?;
    record.reason = row
        .get::<_, Option<String>>(13)?
        .and_then(|reason| InstallReason::from_label(&reason));
    record.license = json_column(row, 14)?;
    record.groups = json_column(row, 15)?;
    record.replaces = json_column(row, 16)?;
    record.depends = json_column(row, 17)?;
    record.optional_depends = json_column(row, 18)?;
    record.conflicts = json_column(row, 19)?;
    record.provides = json_column(row, 20)?;
    record.backup = json_column::<Vec<BackupFile>>(row, 21)?;
    Ok((row.get(0)?, record))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn json_value<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
}

fn load_files(conn: &Connection, package_id: i64, record: &mut PackageRecord) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached("SELECT path FROM files WHERE package_id = ?1")?;
    let rows = stmt.query_map([package_id], |row| row.get::<_, String>(0))?;
    for path in rows {
        record.files.insert(path?);
    }
    Ok(())
}

fn load_record(conn: &Connection, name: &str) -> rusqlite::Result<Option<PackageRecord>> {
    let sql = format!("SELECT {} FROM packages WHERE name = ?1", RECORD_COLUMNS);
    let found = conn.query_row(&sql, [name], record_from_row).optional()?;
    match found {
        Some((id, mut record)) => {
            load_files(conn, id, &mut record)?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Upper bound for a prefix range scan.
fn prefix_end(prefix: &str) -> String {
    format!("{}{}", prefix, char::MAX)
}

fn scan_records(conn: &Connection, lookup: &Lookup<'_>) -> rusqlite::Result<Vec<PackageRecord>> {
    let (filter, args, matcher) = narrow(lookup, "name", |value| Some(value.to_string()));
    let sql = format!(
        "SELECT {} FROM packages {} ORDER BY name",
        RECORD_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), record_from_row)?;
    let mut records = Vec::new();
    for row in rows {
        let (id, mut record) = row?;
        if matcher.is_some_and(|matcher| !matcher.is_match(&record.name)) {
            continue;
        }
        load_files(conn, id, &mut record)?;
        records.push(record);
    }
    Ok(records)
}

fn scan_file_rows(conn: &Connection, lookup: &Lookup<'_>) -> rusqlite::Result<Vec<FileHit>> {
    let (filter, args, matcher) = narrow(lookup, "f.path", |value| {
        value.strip_prefix('/').map(str::to_string)
    });
    let sql = format!(
        "SELECT p.name, p.version, f.path FROM files f JOIN packages p ON p.id = f.package_id {} \
         ORDER BY p.name, f.path",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
    let mut hits = Vec::new();
    while let Some(row) = rows.next()? {
        let path: String = row.get(2)?;
        if let Some(matcher) = matcher {
            if !matcher.is_match(&format!("/{}", path)) {
                continue;
            }
        }
        hits.push(FileHit {
            package: row.get(0)?,
            version: row.get(1)?,
            path,
        });
    }
    Ok(hits)
}

/// Turns a lookup into a SQL filter on `column` plus the matcher still to
/// be applied to each row. `to_stored` maps a query value onto the column's
/// representation; `None` means no stored value can equal it.
fn narrow<'a>(
    lookup: &Lookup<'a>,
    column: &str,
    to_stored: impl Fn(&str) -> Option<String>,
) -> (String, Vec<String>, Option<&'a Matcher>) {
    let exact = |value: &str| match to_stored(value) {
        Some(stored) => (format!("WHERE {} = ?1", column), vec![stored]),
        None => ("WHERE 0".to_string(), Vec::new()),
    };
    match *lookup {
        Lookup::All => (String::new(), Vec::new(), None),
        Lookup::Exact(value) => {
            let (filter, args) = exact(value);
            (filter, args, None)
        }
        Lookup::Matching(matcher) => {
            if let Some(value) = matcher.exact_value() {
                let (filter, args) = exact(value);
                return (filter, args, None);
            }
            match matcher.literal_prefix().and_then(&to_stored) {
                Some(prefix) if !prefix.is_empty() => (
                    format!("WHERE {} >= ?1 AND {} < ?2", column, column),
                    vec![prefix.clone(), prefix_end(&prefix)],
                    Some(matcher),
                ),
                _ => (String::new(), Vec::new(), Some(matcher)),
            }
        }
    }
}

fn write_record(conn: &mut Connection, record: &PackageRecord) -> rusqlite::Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "DELETE FROM files WHERE package_id IN (SELECT id FROM packages WHERE name = ?1)",
        [&record.name],
    )?;
    tx.execute("DELETE FROM packages WHERE name = ?1", [&record.name])?;
    tx.execute(
        "INSERT INTO packages (name, version, filename, description, url, packager, architecture, \
         build_date, install_date, installed_size, compressed_size, checksum, reason, license, \
         groups, replaces, depends, optional_depends, conflicts, provides, backup) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, \
         ?19, ?20, ?21)",
        params![
            record.name,
            record.version,
            record.filename,
            record.description,
            record.url,
            record.packager,
            record.architecture,
            record.build_date.map(|date| date.timestamp()),
            record.install_date.map(|date| date.timestamp()),
            record.installed_size.and_then(|size| i64::try_from(size).ok()),
            record.compressed_size.and_then(|size| i64::try_from(size).ok()),
            record.checksum,
            record.reason.map(|reason| reason.as_str()),
            json_value(&record.license)?,
            json_value(&record.groups)?,
            json_value(&record.replaces)?,
            json_value(&record.depends)?,
            json_value(&record.optional_depends)?,
            json_value(&record.conflicts)?,
            json_value(&record.provides)?,
            json_value(&record.backup)?,
        ],
    )?;
    let package_id = tx.last_insert_rowid();
    {
        let mut stmt = tx.prepare("INSERT INTO files (package_id, path) VALUES (?1, ?2)")?;
        for path in &record.files {
            stmt.execute(params![package_id, path])?;
        }
    }
    tx.commit()
}

fn delete_record(conn: &mut Connection, name: &str) -> rusqlite::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "DELETE FROM files WHERE package_id IN (SELECT id FROM packages WHERE name = ?1)",
        [name],
    )?;
    let removed = tx.execute("DELETE FROM packages WHERE name = ?1", [name])?;
    tx.commit()?;
    Ok(removed > 0)
}

fn clear_records(conn: &mut Connection) -> rusqlite::Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute("DELETE FROM files", [])?;
    let removed = tx.execute("DELETE FROM packages", [])?;
    tx.commit()?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use crate::schema::SCHEMA;
    use crate::store::{FileHit, Lookup, PackageStore, RepoWriter, StoreError};
    use fs4::FileExt;
    use chrono::DateTime;
    use pacfile_core::matcher::{MatchMode, Matcher};
    use pacfile_core::record::{BackupFile, InstallReason, PackageRecord};

    fn record(name: &str, version: &str, files: &[&str]) -> PackageRecord {
        let mut record = PackageRecord::new(name, version);
        record.files = files.iter().map(|file| file.to_string()).collect();
        record
    }

    #[test]
    fn upsert_then_get_returns_every_field() {
        let mut index = RepoWriter::open_in_memory("core").expect("open failed");
        let mut bash = record("bash", "5.1-2", &["usr/bin/bash", "etc/bash.bashrc"]);
        bash.description = Some("The GNU Bourne Again shell".to_string());
        bash.build_date = DateTime::from_timestamp(1_610_000_000, 0);
        bash.installed_size = Some(8_700_000);
        bash.reason = Some(InstallReason::Explicit);
        bash.depends = vec!["readline".to_string(), "glibc".to_string()];
        bash.backup = vec![BackupFile {
            path: "etc/bash.bashrc".to_string(),
            hash: "abc".to_string(),
        }];
        index.upsert(&bash).expect("upsert failed");

        let stored = index.get("bash").expect("get failed");
        assert_eq!(stored, Some(bash));
        assert_eq!(index.get("zsh").expect("get failed"), None);
    }

    #[test]
    fn upsert_replaces_the_file_list() {
        let mut index = RepoWriter::open_in_memory("core").expect("open failed");
        index
            .upsert(&record("x", "1-1", &["a", "b"]))
            .expect("upsert failed");
        index
            .upsert(&record("x", "2-1", &["c"]))
            .expect("upsert failed");

        let stored = index.get("x").expect("get failed").expect("missing record");
        assert_eq!(stored.version, "2-1");
        assert_eq!(stored.files.into_iter().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(index.len().expect("len failed"), 1);
        let hits = index.scan_files(&Lookup::All).expect("scan failed");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn delete_and_clear() {
        let mut index = RepoWriter::open_in_memory("core").expect("open failed");
        index.upsert(&record("a", "1-1", &["a"])).expect("upsert failed");
        index.upsert(&record("b", "1-1", &["b"])).expect("upsert failed");

        assert!(index.delete("a").expect("delete failed"));
        assert!(!index.delete("a").expect("delete failed"));
        assert_eq!(index.clear().expect("clear failed"), 1);
        assert!(index.is_empty().expect("len failed"));
        assert!(index.scan_files(&Lookup::All).expect("scan failed").is_empty());
    }

    #[test]
    fn scan_filters_names() {
        let mut index = RepoWriter::open_in_memory("core").expect("open failed");
        for name in ["foobaz", "foo", "bar", "foobar"] {
            index.upsert(&record(name, "1-1", &[])).expect("upsert failed");
        }
        let names = |lookup: Lookup<'_>| -> Vec<String> {
            index
                .scan(&lookup)
                .expect("scan failed")
                .into_iter()
                .map(|record| record.name)
                .collect()
        };

        assert_eq!(names(Lookup::All), vec!["bar", "foo", "foobar", "foobaz"]);
        assert_eq!(names(Lookup::Exact("foo")), vec!["foo"]);
        let glob = Matcher::new("foo*", MatchMode::Glob, true).expect("compile failed");
        assert_eq!(names(Lookup::Matching(&glob)), vec!["foo", "foobar", "foobaz"]);
        let regex = Matcher::new("a[rz]$", MatchMode::Regex, false).expect("compile failed");
        assert_eq!(names(Lookup::Matching(&regex)), vec!["bar", "foobar", "foobaz"]);
    }

    #[test]
    fn scan_files_matches_absolute_paths() {
        let mut index = RepoWriter::open_in_memory("core").expect("open failed");
        index
            .upsert(&record("bash", "5.1-2", &["usr/bin/bash", "usr/share/man/man1/bash.1.gz"]))
            .expect("upsert failed");
        index
            .upsert(&record("zsh", "5.9-1", &["usr/bin/zsh"]))
            .expect("upsert failed");

        let exact = index
            .scan_files(&Lookup::Exact("/usr/bin/bash"))
            .expect("scan failed");
        assert_eq!(
            exact,
            vec![FileHit {
                package: "bash".to_string(),
                version: "5.1-2".to_string(),
                path: "usr/bin/bash".to_string()
            }]
        );
        assert!(index
            .scan_files(&Lookup::Exact("usr/bin/bash"))
            .expect("scan failed")
            .is_empty());

        let glob = Matcher::new("/usr/bin/*", MatchMode::Glob, true).expect("compile failed");
        let paths: Vec<String> = index
            .scan_files(&Lookup::Matching(&glob))
            .expect("scan failed")
            .into_iter()
            .map(|hit| hit.path)
            .collect();
        assert_eq!(paths, vec!["usr/bin/bash", "usr/bin/zsh"]);
    }

    #[test]
    fn store_lists_and_removes_repositories() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let store = PackageStore::open(dir.path()).expect("open store failed");
        for name in ["extra", "core"] {
            let mut index = store.open_writer(name).expect("open writer failed");
            index.upsert(&record("x", "1-1", &[])).expect("upsert failed");
        }

        assert_eq!(
            store.repositories().expect("list failed"),
            vec!["core".to_string(), "extra".to_string()]
        );
        let reader = store.open_reader("core").expect("open reader failed");
        assert_eq!(reader.len().expect("len failed"), 1);
        drop(reader);

        assert!(store.remove("core").expect("remove failed"));
        assert!(!store.remove("core").expect("remove failed"));
        assert!(!store.contains("core"));
        assert!(matches!(
            store.open_reader("core"),
            Err(StoreError::Missing(_))
        ));
    }

    #[test]
    fn index_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let store = PackageStore::open(dir.path()).expect("open store failed");
        {
            let mut index = store.open_writer("local").expect("open writer failed");
            index
                .upsert(&record("bash", "5.1-2", &["usr/bin/bash"]))
                .expect("upsert failed");
            index.set_meta("source", "/var/lib/pacman/local").expect("meta failed");
        }
        let index = store.open_reader("local").expect("reopen failed");
        assert!(index.get("bash").expect("get failed").is_some());
        assert_eq!(
            index.meta_value("source").expect("meta failed").as_deref(),
            Some("/var/lib/pacman/local")
        );
    }

    #[test]
    fn corrupt_database_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        std::fs::write(
            dir.path().join("core.db"),
            b"this is definitely not an sqlite database, but it is long enough to look like a header",
        )
        .expect("write failed");
        let store = PackageStore::open(dir.path()).expect("open store failed");
        let result = store.open_reader("core");
        assert!(
            matches!(result, Err(StoreError::Corrupt { ref repository, .. }) if repository == "core"),
            "unexpected result: {:?}",
            result
        );
    }

    #[test]
    fn foreign_schema_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let path = dir.path().join("core.db");
        {
            let conn = rusqlite::Connection::open(&path).expect("open failed");
            conn.execute_batch("CREATE TABLE unrelated (id INTEGER);")
                .expect("create failed");
        }
        let store = PackageStore::open(dir.path()).expect("open store failed");
        assert!(matches!(
            store.open_reader("core"),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn repository_names_stay_inside_the_store() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let store = PackageStore::open(dir.path()).expect("open store failed");
        for name in ["", "../etc", ".hidden", "a/b"] {
            assert!(matches!(
                store.open_writer(name),
                Err(StoreError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn second_writer_waits_for_the_lock() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let store = PackageStore::open(dir.path()).expect("open store failed");
        let mut writer = store.open_writer("core").expect("open writer failed");
        writer
            .upsert(&record("bash", "5.2-1", &["usr/bin/bash"]))
            .expect("upsert failed");

        let contender = std::fs::File::open(dir.path().join("core.lock")).expect("open lock failed");
        assert!(contender.try_lock_exclusive().is_err());

        let reader = store.open_reader("core").expect("open reader failed");
        assert_eq!(reader.len().expect("len failed"), 1);

        drop(writer);
        contender
            .try_lock_exclusive()
            .expect("lock still held after the writer was dropped");
    }

    #[test]
    fn remove_keeps_the_lock_file() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let store = PackageStore::open(dir.path()).expect("open store failed");
        drop(store.open_writer("core").expect("open writer failed"));

        assert!(store.remove("core").expect("remove failed"));
        assert!(!dir.path().join("core.db").exists());
        assert!(dir.path().join("core.lock").exists());
        assert_eq!(store.repositories().expect("list failed"), Vec::<String>::new());

        let index = store.open_writer("core").expect("reopen writer failed");
        assert!(index.is_empty().expect("len failed"));
    }

    #[test]
    fn interrupted_initialisation_is_completed() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        {
            let conn = rusqlite::Connection::open(dir.path().join("core.db")).expect("open failed");
            conn.execute_batch(SCHEMA).expect("create failed");
        }
        let store = PackageStore::open(dir.path()).expect("open store failed");
        let index = store.open_writer("core").expect("open writer failed");
        assert_eq!(
            index.meta_value("schema_version").expect("meta failed").as_deref(),
            Some("1")
        );
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let store = PackageStore::open(dir.path()).expect("open store failed");
        {
            let mut index = store.open_writer("core").expect("open writer failed");
            index.set_meta("schema_version", "99").expect("meta failed");
        }
        let result = store.open_reader("core");
        assert!(
            matches!(result, Err(StoreError::Corrupt { ref detail, .. }) if detail.contains("99")),
            "unexpected result: {:?}",
            result
        );
    }
}
