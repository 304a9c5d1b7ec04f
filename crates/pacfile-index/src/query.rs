use pacfile_core::matcher::{MatchMode, Matcher, PatternError};
use pacfile_core::query::{is_binary_path, QueryMatch, QueryOptions, Scope};
use pacfile_core::record::{PackageRecord, LOCAL_REPOSITORY};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

use crate::store::{FileHit, Lookup, PackageStore, RepoIndex, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    InvalidPattern(#[from] PatternError),
    #[error("invalid target {0:?}: expected <package> or <repository>/<package>")]
    InvalidTarget(String),
    #[error("unknown repository: {0}")]
    UnknownRepository(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A package that owns a queried file, with all of its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageDetails {
    pub repository: String,
    #[serde(flatten)]
    pub record: PackageRecord,
}

/// Read-only queries over an ordered set of repository indexes.
#[derive(Debug)]
pub struct QueryEngine {
    repositories: Vec<RepoIndex>,
}

impl QueryEngine {
    /// Results are attributed and ordered by the position of each index.
    pub fn new(repositories: Vec<RepoIndex>) -> Self {
        QueryEngine { repositories }
    }

    /// Opens every named repository that has an index, `local` first and
    /// the rest in the order given. Names that were never synced are left
    /// out.
    pub fn open(store: &PackageStore, names: &[String]) -> Result<Self, QueryError> {
        let ordered = names
            .iter()
            .filter(|name| name.as_str() == LOCAL_REPOSITORY)
            .chain(names.iter().filter(|name| name.as_str() != LOCAL_REPOSITORY));
        let mut repositories: Vec<RepoIndex> = Vec::new();
        for name in ordered {
            if repositories.iter().any(|index| index.name() == name) {
                continue;
            }
            if !store.contains(name) {
                debug!(repository = %name, "repository has no index, skipping");
                continue;
            }
            repositories.push(store.open_reader(name)?);
        }
        Ok(QueryEngine { repositories })
    }

    pub fn repositories(&self) -> impl Iterator<Item = &str> {
        self.repositories.iter().map(|index| index.name())
    }

    /// Packages owning files that match `query`.
    ///
    /// When no scope is given and `query` is an absolute path that exists on
    /// this machine, only `local` is searched. Relative queries never narrow
    /// the scope, whatever the current directory holds.
    pub fn find_owner(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<QueryMatch>, QueryError> {
        let pattern = match options.mode {
            MatchMode::Exact | MatchMode::Glob => absolute_query(query),
            MatchMode::Regex => query.to_string(),
        };
        let matcher = Matcher::new(&pattern, options.mode, options.case_sensitive)?;
        let scope = match &options.scope {
            Some(scope) => scope.clone(),
            None if query.starts_with('/') && Path::new(query).exists() => {
                debug!(query, "query names an existing path, searching local only");
                Scope::Local
            }
            None => Scope::All,
        };
        debug!(
            pattern = matcher.pattern(),
            mode = ?matcher.mode(),
            scope = %scope,
            "finding owners"
        );

        let mut matches = Vec::new();
        for index in self.in_scope(&scope)? {
            let hits = index.scan_files(&Lookup::Matching(&matcher))?;
            matches.extend(group_hits(index.name(), hits, options.binaries_only));
        }
        Ok(matches)
    }

    /// Files owned by packages whose name matches `target`, which is a
    /// package name or `<repository>/<package>`.
    pub fn list_files(
        &self,
        target: &str,
        options: &QueryOptions,
    ) -> Result<Vec<QueryMatch>, QueryError> {
        let (repository, package) = split_target(target)?;
        let matcher = Matcher::new(package, options.mode, options.case_sensitive)?;
        let scope = match repository {
            Some(repository) => Scope::Repository(repository.to_string()),
            None => options.scope.clone().unwrap_or(Scope::All),
        };

        let mut matches = Vec::new();
        for index in self.in_scope(&scope)? {
            for record in index.scan(&Lookup::Matching(&matcher))? {
                let files: Vec<String> = record
                    .files
                    .into_iter()
                    .filter(|path| !options.binaries_only || is_binary_path(path))
                    .collect();
                if options.binaries_only && files.is_empty() {
                    continue;
                }
                matches.push(QueryMatch {
                    repository: index.name().to_string(),
                    package: record.name,
                    version: record.version,
                    files,
                });
            }
        }
        Ok(matches)
    }

    /// The first package owning a matching file in each repository, with
    /// its full metadata.
    pub fn info(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Vec<PackageDetails>, QueryError> {
        let mut details: Vec<PackageDetails> = Vec::new();
        for found in self.find_owner(query, options)? {
            if details
                .iter()
                .any(|detail| detail.repository == found.repository)
            {
                continue;
            }
            let Some(index) = self
                .repositories
                .iter()
                .find(|index| index.name() == found.repository)
            else {
                continue;
            };
            if let Some(record) = index.get(&found.package)? {
                details.push(PackageDetails {
                    repository: found.repository,
                    record,
                });
            }
        }
        Ok(details)
    }

    fn in_scope(&self, scope: &Scope) -> Result<Vec<&RepoIndex>, QueryError> {
        if let Scope::Repository(name) = scope {
            if !self.repositories.iter().any(|index| index.name() == name) {
                return Err(QueryError::UnknownRepository(name.clone()));
            }
        }
        Ok(self
            .repositories
            .iter()
            .filter(|index| scope.includes(index.name()))
            .collect())
    }
}

/// Stored paths are relative; queries are matched against `/` + path.
fn absolute_query(query: &str) -> String {
    if query.starts_with(['/', '*', '?']) {
        query.to_string()
    } else {
        format!("/{}", query)
    }
}

fn split_target(target: &str) -> Result<(Option<&str>, &str), QueryError> {
    let mut parts = target.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(package), None, None) if !package.is_empty() => Ok((None, package)),
        (Some(repository), Some(package), None) if !repository.is_empty() && !package.is_empty() => {
            Ok((Some(repository), package))
        }
        _ => Err(QueryError::InvalidTarget(target.to_string())),
    }
}

/// Folds hits, already ordered by package, into one match per package.
fn group_hits(repository: &str, hits: Vec<FileHit>, binaries_only: bool) -> Vec<QueryMatch> {
    let mut matches: Vec<QueryMatch> = Vec::new();
    for hit in hits {
        if binaries_only && !is_binary_path(&hit.path) {
            continue;
        }
        match matches.last_mut() {
            Some(last) if last.package == hit.package => last.files.push(hit.path),
            _ => matches.push(QueryMatch {
                repository: repository.to_string(),
                package: hit.package,
                version: hit.version,
                files: vec![hit.path],
            }),
        }
    }
    matches
}
