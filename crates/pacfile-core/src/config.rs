use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(std::io::Error),
    #[error("failed to write config file: {0}")]
    Write(std::io::Error),
    #[error("failed to parse toml: {0}")]
    Parse(toml::de::Error),
    #[error("failed to serialize toml: {0}")]
    Serialize(toml::ser::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub pacfile: PacfileSection,
    #[serde(default)]
    pub index: IndexSection,
    #[serde(default)]
    pub local: LocalSection,
    #[serde(default)]
    pub repos: Vec<RepoSection>,
    #[serde(default)]
    pub search: SearchSection,
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        let config = toml::from_str(&content).map_err(ConfigError::Parse)?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content).map_err(ConfigError::Write)?;
        Ok(())
    }

    pub fn repo(&self, name: &str) -> Option<&RepoSection> {
        self.repos.iter().find(|repo| repo.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PacfileSection {
    pub version: String,
}

impl Default for PacfileSection {
    fn default() -> Self {
        PacfileSection {
            version: "0.1.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexSection {
    /// Directory holding one database per repository.
    pub dir: PathBuf,
}

impl Default for IndexSection {
    fn default() -> Self {
        IndexSection {
            dir: PathBuf::from("/var/cache/pacfile"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalSection {
    pub enabled: bool,
    /// The package manager's database of installed packages, one
    /// `name-version` directory per package.
    pub path: PathBuf,
}

impl Default for LocalSection {
    fn default() -> Self {
        LocalSection {
            enabled: true,
            path: PathBuf::from("/var/lib/pacman/local"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoSection {
    pub name: String,
    /// A `.files` tar archive for the repository, already downloaded.
    pub archive: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SearchSection {
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub binaries: bool,
}
