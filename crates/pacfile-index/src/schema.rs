pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS packages (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    version TEXT NOT NULL,
    filename TEXT,
    description TEXT,
    url TEXT,
    packager TEXT,
    architecture TEXT,
    build_date INTEGER,
    install_date INTEGER,
    installed_size INTEGER,
    compressed_size INTEGER,
    checksum TEXT,
    reason TEXT,
    license TEXT NOT NULL DEFAULT '[]',
    groups TEXT NOT NULL DEFAULT '[]',
    replaces TEXT NOT NULL DEFAULT '[]',
    depends TEXT NOT NULL DEFAULT '[]',
    optional_depends TEXT NOT NULL DEFAULT '[]',
    conflicts TEXT NOT NULL DEFAULT '[]',
    provides TEXT NOT NULL DEFAULT '[]',
    backup TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS files (
    package_id INTEGER NOT NULL REFERENCES packages(id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    PRIMARY KEY (package_id, path)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub const EXPECTED_TABLES: [&str; 3] = ["packages", "files", "meta"];
