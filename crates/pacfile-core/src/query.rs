use serde::{Deserialize, Serialize};
use std::fmt;

use crate::matcher::MatchMode;
use crate::record::LOCAL_REPOSITORY;

/// Which repositories a query may search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Local,
    /// Every repository except `local`.
    Remote,
    Repository(String),
}

impl Scope {
    pub fn includes(&self, repository: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Local => repository == LOCAL_REPOSITORY,
            Scope::Remote => repository != LOCAL_REPOSITORY,
            Scope::Repository(name) => repository == name,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => write!(f, "all repositories"),
            Scope::Local => write!(f, "{}", LOCAL_REPOSITORY),
            Scope::Remote => write!(f, "remote repositories"),
            Scope::Repository(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryOptions {
    pub mode: MatchMode,
    /// `None` when the caller did not ask for a scope; searches everything
    /// unless the query itself implies otherwise.
    pub scope: Option<Scope>,
    pub case_sensitive: bool,
    pub binaries_only: bool,
}

/// One package that satisfied a query, with the files that matched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryMatch {
    pub repository: String,
    pub package: String,
    pub version: String,
    pub files: Vec<String>,
}

/// True for paths inside a `bin/` or `sbin/` directory.
pub fn is_binary_path(path: &str) -> bool {
    let mut segments = path.split('/').rev();
    segments.next();
    segments.any(|segment| segment == "bin" || segment == "sbin")
}

#[cfg(test)]
mod tests {
    use crate::query::{is_binary_path, Scope};

    #[test]
    fn binary_paths_need_a_bin_directory() {
        assert!(is_binary_path("usr/bin/bash"));
        assert!(is_binary_path("usr/sbin/ldconfig"));
        assert!(is_binary_path("bin/sh"));
        assert!(is_binary_path("usr/bin/"));
        assert!(!is_binary_path("usr/bin"));
        assert!(!is_binary_path("usr/share/doc/binutils/README"));
        assert!(!is_binary_path("usr/lib/cabin/x"));
    }

    #[test]
    fn scope_membership() {
        assert!(Scope::All.includes("core"));
        assert!(Scope::Local.includes("local"));
        assert!(!Scope::Local.includes("core"));
        assert!(Scope::Remote.includes("extra"));
        assert!(!Scope::Remote.includes("local"));
        assert!(Scope::Repository("core".to_string()).includes("core"));
        assert!(!Scope::Repository("core".to_string()).includes("extra"));
    }
}
