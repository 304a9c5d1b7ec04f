use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand};
use pacfile_core::config::{Config, ConfigError, RepoSection, SearchSection};
use pacfile_core::matcher::MatchMode;
use pacfile_core::query::{QueryMatch, QueryOptions, Scope};
use pacfile_core::record::LOCAL_REPOSITORY;
use pacfile_index::store::validate_name;
use pacfile_index::{
    sync_repository, ArchiveSource, DirectorySource, PackageDetails, PackageStore, QueryEngine,
    QueryError, StoreError, SyncError, SyncReport,
};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "pacfile",
    version,
    about = "Find which package owns a file, installed or not"
)]
struct Cli {
    #[arg(long, value_name = "PATH", global = true, help = "Config file to use")]
    config: Option<PathBuf>,
    #[arg(
        long = "index-dir",
        value_name = "PATH",
        global = true,
        help = "Directory holding the repository indexes"
    )]
    index_dir: Option<PathBuf>,
    #[arg(
        short = 'v',
        long = "verbose",
        global = true,
        help = "Increase verbosity",
        conflicts_with = "quiet"
    )]
    verbose: bool,
    #[arg(
        short = 'q',
        long = "quiet",
        global = true,
        help = "Suppress non-error output"
    )]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Sync local and repository indexes")]
    Update {
        #[arg(help = "Only update this repository")]
        repo: Option<String>,
    },
    #[command(about = "Find the packages owning a file")]
    Search {
        pattern: String,
        #[command(flatten)]
        query: QueryArgs,
    },
    #[command(about = "List the files of a package ([repo/]name)")]
    List {
        package: String,
        #[command(flatten)]
        query: QueryArgs,
    },
    #[command(about = "Show details of the package owning a file")]
    Info {
        path: String,
        #[command(flatten)]
        query: QueryArgs,
    },
    #[command(about = "Show repository index status")]
    Status,
    #[command(about = "Delete a repository index")]
    Remove { repo: String },
    #[command(name = "add-repo", about = "Add a repository's files archive to the config")]
    AddRepo {
        name: String,
        #[arg(help = "Path to the repository's .files archive")]
        archive: PathBuf,
    },
    #[command(about = "Print shell completions")]
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Clone, Default, Args)]
struct QueryArgs {
    #[arg(short = 'g', long, help = "Match with shell wildcards", conflicts_with = "regex")]
    glob: bool,
    #[arg(short = 'r', long, help = "Match with a regular expression")]
    regex: bool,
    #[arg(short = 'c', long = "case-sensitive", help = "Case-sensitive matching")]
    case_sensitive: bool,
    #[arg(short = 'b', long, help = "Only report files in bin/ and sbin/")]
    binaries: bool,
    #[arg(
        short = 'R',
        long = "repo",
        value_name = "NAME",
        help = "Only search this repository",
        conflicts_with_all = ["local", "remote"]
    )]
    repo: Option<String>,
    #[arg(short = 'l', long, help = "Only search installed packages", conflicts_with = "remote")]
    local: bool,
    #[arg(long, help = "Only search sync repositories")]
    remote: bool,
    #[arg(long, help = "Print results as JSON")]
    json: bool,
}

impl QueryArgs {
    fn to_options(&self, search: &SearchSection) -> QueryOptions {
        let mode = if self.glob {
            MatchMode::Glob
        } else if self.regex {
            MatchMode::Regex
        } else {
            MatchMode::Exact
        };
        let scope = if let Some(repo) = &self.repo {
            Some(Scope::Repository(repo.clone()))
        } else if self.local {
            Some(Scope::Local)
        } else if self.remote {
            Some(Scope::Remote)
        } else {
            None
        };
        QueryOptions {
            mode,
            scope,
            case_sensitive: self.case_sensitive || search.case_sensitive,
            binaries_only: self.binaries || search.binaries,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing home directory in environment")]
    MissingHome,
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("index error: {0}")]
    Store(#[from] StoreError),
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("{0}")]
    Query(#[from] QueryError),
    #[error("unknown repository: {0}")]
    UnknownRepository(String),
    #[error("repository {0} is already configured")]
    DuplicateRepository(String),
    #[error("no package owns {0}")]
    NoOwner(String),
    #[error("package {0:?} not found")]
    PackageNotFound(String),
    #[error("{failed} of {total} repositories failed to update")]
    UpdateFailed { failed: usize, total: usize },
    #[error("failed to encode json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
struct Output {
    quiet: bool,
    verbose: bool,
}

impl Output {
    fn info(&self, message: impl AsRef<str>) {
        if !self.quiet {
            println!("{}", message.as_ref());
        }
    }

    fn status(&self, message: impl AsRef<str>) {
        if !self.quiet {
            eprintln!("{}", message.as_ref());
        }
    }

    fn warn(&self, message: impl AsRef<str>) {
        if !self.quiet {
            eprintln!("{}", message.as_ref());
        }
    }

    fn verbose(&self, message: impl AsRef<str>) {
        if self.verbose && !self.quiet {
            eprintln!("{}", message.as_ref());
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    let output = Output {
        quiet: cli.quiet,
        verbose: cli.verbose,
    };

    if let Command::Completions { shell } = cli.command {
        let mut command = Cli::command();
        clap_complete::generate(shell, &mut command, "pacfile", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    if let Command::AddRepo { name, archive } = &cli.command {
        return run_add_repo(&output, config, cli.config.as_deref(), name, archive);
    }
    let index_dir = cli
        .index_dir
        .clone()
        .unwrap_or_else(|| config.index.dir.clone());
    let store = PackageStore::open(&index_dir)?;
    output.verbose(format!("index: {}", index_dir.display()));

    match cli.command {
        Command::Update { repo } => run_update(&output, &config, &store, repo.as_deref()),
        Command::Search { pattern, query } => {
            let engine = QueryEngine::open(&store, &repository_order(&config))?;
            let matches = engine.find_owner(&pattern, &query.to_options(&config.search))?;
            if query.json {
                output.info(serde_json::to_string_pretty(&matches)?);
                return Ok(());
            }
            if matches.is_empty() {
                return Err(CliError::NoOwner(pattern));
            }
            for found in &matches {
                for line in owner_lines(found, output.verbose) {
                    output.info(line);
                }
            }
            Ok(())
        }
        Command::List { package, query } => {
            let engine = QueryEngine::open(&store, &repository_order(&config))?;
            let matches = engine.list_files(&package, &query.to_options(&config.search))?;
            if query.json {
                output.info(serde_json::to_string_pretty(&matches)?);
                return Ok(());
            }
            if matches.is_empty() {
                return Err(CliError::PackageNotFound(package));
            }
            for found in &matches {
                for line in file_lines(found) {
                    output.info(line);
                }
            }
            Ok(())
        }
        Command::Info { path, query } => {
            let engine = QueryEngine::open(&store, &repository_order(&config))?;
            let details = engine.info(&path, &query.to_options(&config.search))?;
            if query.json {
                output.info(serde_json::to_string_pretty(&details)?);
                return Ok(());
            }
            if details.is_empty() {
                return Err(CliError::NoOwner(path));
            }
            for (position, detail) in details.iter().enumerate() {
                if position > 0 {
                    output.info("");
                }
                for line in describe_package(detail) {
                    output.info(line);
                }
            }
            Ok(())
        }
        Command::Status => run_status(&output, &store),
        Command::Remove { repo } => {
            if store.remove(&repo)? {
                output.info(format!("removed {}", repo));
                Ok(())
            } else {
                Err(CliError::UnknownRepository(repo))
            }
        }
        Command::Completions { .. } | Command::AddRepo { .. } => Ok(()),
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

enum UpdateTarget {
    Local(PathBuf),
    Archive { name: String, path: PathBuf },
}

impl UpdateTarget {
    fn name(&self) -> &str {
        match self {
            UpdateTarget::Local(_) => LOCAL_REPOSITORY,
            UpdateTarget::Archive { name, .. } => name,
        }
    }

    fn sync(&self, store: &PackageStore) -> Result<SyncReport, SyncError> {
        match self {
            UpdateTarget::Local(path) => {
                let mut source = DirectorySource::new(path);
                sync_repository(store, LOCAL_REPOSITORY, &mut source)
            }
            UpdateTarget::Archive { name, path } => {
                let mut source = ArchiveSource::open(path)?;
                sync_repository(store, name, &mut source)
            }
        }
    }
}

fn update_targets(config: &Config, only: Option<&str>) -> Result<Vec<UpdateTarget>, CliError> {
    let mut targets = Vec::new();
    if config.local.enabled && only.map_or(true, |name| name == LOCAL_REPOSITORY) {
        targets.push(UpdateTarget::Local(config.local.path.clone()));
    }
    for repo in &config.repos {
        if only.map_or(true, |name| name == repo.name) {
            targets.push(UpdateTarget::Archive {
                name: repo.name.clone(),
                path: repo.archive.clone(),
            });
        }
    }
    match only {
        Some(name) if targets.is_empty() => Err(CliError::UnknownRepository(name.to_string())),
        _ => Ok(targets),
    }
}

fn run_update(
    output: &Output,
    config: &Config,
    store: &PackageStore,
    only: Option<&str>,
) -> Result<(), CliError> {
    let targets = update_targets(config, only)?;
    if targets.is_empty() {
        output.warn("nothing to update: local index disabled and no repositories configured");
        return Ok(());
    }

    let mut failed = 0;
    for target in &targets {
        output.status(format!("updating {}", target.name()));
        match target.sync(store) {
            Ok(report) => {
                output.info(format!(
                    "{}: {} added, {} updated, {} removed",
                    target.name(),
                    report.added,
                    report.updated,
                    report.removed
                ));
                output.verbose(format!(
                    "{}: {} unchanged, {} skipped",
                    target.name(),
                    report.unchanged,
                    report.skipped
                ));
            }
            Err(err) => {
                failed += 1;
                output.warn(format!("{}: update failed: {}", target.name(), err));
            }
        }
    }
    if failed > 0 {
        return Err(CliError::UpdateFailed {
            failed,
            total: targets.len(),
        });
    }
    Ok(())
}

fn run_status(output: &Output, store: &PackageStore) -> Result<(), CliError> {
    let repositories = store.repositories()?;
    output.info(format!("index: {}", store.dir().display()));
    if repositories.is_empty() {
        output.info("no repositories synced");
        return Ok(());
    }
    for name in repositories {
        let index = match store.open_reader(&name) {
            Ok(index) => index,
            Err(err) => {
                output.warn(format!("{}: {}", name, err));
                continue;
            }
        };
        let meta = index.meta()?;
        let value = |key: &str| meta.get(key).map(String::as_str).unwrap_or("-");
        output.info(format!(
            "{}: {} packages, synced {}",
            name,
            value("package_count"),
            value("synced_at")
        ));
        output.verbose(format!("  source: {}", value("source")));
    }
    Ok(())
}

fn run_add_repo(
    output: &Output,
    mut config: Config,
    explicit: Option<&Path>,
    name: &str,
    archive: &Path,
) -> Result<(), CliError> {
    add_repo(&mut config, name, archive)?;
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => config_path()?,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(ConfigError::Write)?;
    }
    config.save_to_path(&path)?;
    debug!(path = %path.display(), repository = name, "saved config");
    output.info(format!("added {} ({})", name, archive.display()));
    Ok(())
}

fn add_repo(config: &mut Config, name: &str, archive: &Path) -> Result<(), CliError> {
    validate_name(name)?;
    if name == LOCAL_REPOSITORY || config.repo(name).is_some() {
        return Err(CliError::DuplicateRepository(name.to_string()));
    }
    config.repos.push(RepoSection {
        name: name.to_string(),
        archive: archive.to_path_buf(),
    });
    Ok(())
}

/// `local` first, then configured repositories in config order.
fn repository_order(config: &Config) -> Vec<String> {
    let mut names = Vec::new();
    if config.local.enabled {
        names.push(LOCAL_REPOSITORY.to_string());
    }
    names.extend(config.repos.iter().map(|repo| repo.name.clone()));
    names
}

fn owner_lines(found: &QueryMatch, verbose: bool) -> Vec<String> {
    if !verbose {
        return vec![format!("{}/{}", found.repository, found.package)];
    }
    found
        .files
        .iter()
        .map(|path| {
            format!(
                "{}/{} {}\t/{}",
                found.repository, found.package, found.version, path
            )
        })
        .collect()
}

fn file_lines(found: &QueryMatch) -> Vec<String> {
    found
        .files
        .iter()
        .map(|path| format!("{}/{} /{}", found.repository, found.package, path))
        .collect()
}

fn describe_package(detail: &PackageDetails) -> Vec<String> {
    let record = &detail.record;
    let list = |values: &[String]| {
        if values.is_empty() {
            "None".to_string()
        } else {
            values.join("  ")
        }
    };
    let text = |value: &Option<String>| value.clone().unwrap_or_else(|| "None".to_string());
    let date = |value: &Option<DateTime<Utc>>| {
        value
            .map(|date| date.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "None".to_string())
    };
    let size = |value: Option<u64>| {
        value
            .map(|bytes| format!("{:.2} KiB", bytes as f64 / 1024.0))
            .unwrap_or_else(|| "None".to_string())
    };

    let mut lines = vec![
        format!("Repository      : {}", detail.repository),
        format!("Name            : {}", record.name),
        format!("Version         : {}", record.version),
        format!("Description     : {}", text(&record.description)),
        format!("Architecture    : {}", text(&record.architecture)),
        format!("URL             : {}", text(&record.url)),
        format!("Licenses        : {}", list(&record.license)),
        format!("Groups          : {}", list(&record.groups)),
        format!("Provides        : {}", list(&record.provides)),
        format!("Depends On      : {}", list(&record.depends)),
        format!("Optional Deps   : {}", list(&record.optional_depends)),
        format!("Conflicts With  : {}", list(&record.conflicts)),
        format!("Replaces        : {}", list(&record.replaces)),
        format!("Download Size   : {}", size(record.compressed_size)),
        format!("Installed Size  : {}", size(record.installed_size)),
        format!("Packager        : {}", text(&record.packager)),
        format!("Build Date      : {}", date(&record.build_date)),
    ];
    if detail.repository == LOCAL_REPOSITORY {
        lines.push(format!("Install Date    : {}", date(&record.install_date)));
        lines.push(format!(
            "Install Reason  : {}",
            record
                .reason
                .map(|reason| reason.to_string())
                .unwrap_or_else(|| "None".to_string())
        ));
    }
    lines
}

fn load_config(explicit: Option<&Path>) -> Result<Config, CliError> {
    if let Some(path) = explicit {
        debug!(path = %path.display(), "loading config");
        return Config::load_from_path(path).map_err(CliError::Config);
    }
    let path = config_path()?;
    if path.exists() {
        debug!(path = %path.display(), "loading config");
        Config::load_from_path(&path).map_err(CliError::Config)
    } else {
        debug!(path = %path.display(), "no config file, using defaults");
        Ok(Config::default())
    }
}

fn config_dir() -> Result<PathBuf, CliError> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir).join("pacfile"));
    }
    home_dir().map(|home| home.join(".config").join("pacfile"))
}

fn config_path() -> Result<PathBuf, CliError> {
    Ok(config_dir()?.join("config.toml"))
}

fn home_dir() -> Result<PathBuf, CliError> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| CliError::MissingHome)
}
