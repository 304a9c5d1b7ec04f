use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Fixture {
    root: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("failed to create temp dir");
        let fixture = Fixture { root };
        fixture.write_local_db();
        fixture.write_core_archive();
        fixture.write_config();
        fixture
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn config_path(&self) -> PathBuf {
        self.path().join("config.toml")
    }

    fn write_local_db(&self) {
        let package = self.path().join("local").join("bash-5.1-2");
        fs::create_dir_all(&package).expect("failed to create local package");
        fs::write(
            package.join("desc"),
            "%NAME%\nbash\n\n%VERSION%\n5.1-2\n\n%DESC%\nThe GNU Bourne Again shell\n\n%REASON%\n0\n",
        )
        .expect("failed to write desc");
        fs::write(
            package.join("files"),
            "%FILES%\nusr/\nusr/bin/\nusr/bin/bash\nusr/share/man/man1/bash.1.gz\n",
        )
        .expect("failed to write files");
        fs::write(self.path().join("local").join("ALPM_DB_VERSION"), "9\n")
            .expect("failed to write db version");
    }

    fn write_core_archive(&self) {
        let entries = [
            (
                "bash-5.2-1/desc",
                "%NAME%\nbash\n\n%VERSION%\n5.2-1\n\n%CSIZE%\n2048\n",
            ),
            ("bash-5.2-1/files", "%FILES%\nusr/bin/bash\n"),
            (
                "coreutils-9.4-1/desc",
                "%NAME%\ncoreutils\n\n%VERSION%\n9.4-1\n",
            ),
            (
                "coreutils-9.4-1/files",
                "%FILES%\nusr/bin/ls\nusr/bin/cp\nusr/share/info/coreutils.info.gz\n",
            ),
        ];
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, path, content.as_bytes())
                .expect("failed to append entry");
        }
        let tar = builder.into_inner().expect("failed to finish tar");
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar).expect("failed to compress");
        let archive = encoder.finish().expect("failed to finish gzip");
        fs::write(self.path().join("core.files.tar.gz"), archive).expect("failed to write archive");
    }

    fn write_config(&self) {
        let config = format!(
            r#"[index]
dir = "{index}"

[local]
enabled = true
path = "{local}"

[[repos]]
name = "core"
archive = "{archive}"
"#,
            index = self.path().join("index").display(),
            local = self.path().join("local").display(),
            archive = self.path().join("core.files.tar.gz").display(),
        );
        fs::write(self.config_path(), config).expect("failed to write config");
    }

    fn pacfile(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_pacfile"))
            .arg("--config")
            .arg(self.config_path())
            .args(args)
            .env("HOME", self.path())
            .env_remove("XDG_CONFIG_HOME")
            .env_remove("RUST_LOG")
            .output()
            .expect("failed to run pacfile")
    }

    fn updated(self) -> Self {
        let output = self.pacfile(&["update"]);
        assert_success(&output);
        self
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "pacfile failed\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn update_syncs_local_and_archive() {
    let fixture = Fixture::new();
    let output = fixture.pacfile(&["update"]);
    assert_success(&output);
    let text = stdout(&output);
    assert!(text.contains("local: 1 added, 0 updated, 0 removed"), "{}", text);
    assert!(text.contains("core: 2 added, 0 updated, 0 removed"), "{}", text);

    let again = fixture.pacfile(&["update"]);
    assert_success(&again);
    assert!(stdout(&again).contains("local: 0 added, 0 updated, 0 removed"));
}

#[test]
fn search_finds_owners_in_every_repository() {
    let fixture = Fixture::new().updated();
    let output = fixture.pacfile(&["search", "-g", "*/bin/bash"]);
    assert_success(&output);
    assert_eq!(stdout(&output), "local/bash\ncore/bash\n");

    let remote = fixture.pacfile(&["search", "--remote", "usr/bin/ls"]);
    assert_success(&remote);
    assert_eq!(stdout(&remote), "core/coreutils\n");
}

#[test]
fn search_without_owner_fails() {
    let fixture = Fixture::new().updated();
    let output = fixture.pacfile(&["search", "usr/bin/nothing-owns-this"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no package owns"));
}

#[test]
fn search_json_output() {
    let fixture = Fixture::new().updated();
    let output = fixture.pacfile(&["search", "--json", "-r", "bin/(ls|cp)$"]);
    assert_success(&output);
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("invalid json output");
    let matches = value.as_array().expect("expected an array");
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["repository"], "core");
    assert_eq!(matches[0]["package"], "coreutils");
    assert_eq!(
        matches[0]["files"],
        serde_json::json!(["usr/bin/cp", "usr/bin/ls"])
    );
}

#[test]
fn list_prints_package_files() {
    let fixture = Fixture::new().updated();
    let output = fixture.pacfile(&["list", "core/coreutils", "-b"]);
    assert_success(&output);
    assert_eq!(
        stdout(&output),
        "core/coreutils /usr/bin/cp\ncore/coreutils /usr/bin/ls\n"
    );

    let missing = fixture.pacfile(&["list", "core/zsh"]);
    assert!(!missing.status.success());
}

#[test]
fn status_and_remove() {
    let fixture = Fixture::new().updated();
    let status = fixture.pacfile(&["status"]);
    assert_success(&status);
    let text = stdout(&status);
    assert!(text.contains("core: 2 packages"), "{}", text);
    assert!(text.contains("local: 1 packages"), "{}", text);

    assert_success(&fixture.pacfile(&["remove", "core"]));
    let text = stdout(&fixture.pacfile(&["status"]));
    assert!(!text.contains("core:"), "{}", text);
    assert!(!fixture.pacfile(&["remove", "core"]).status.success());
}

#[test]
fn add_repo_extends_the_config() {
    let fixture = Fixture::new();
    let archive = fixture.path().join("core.files.tar.gz");
    let archive = archive.to_str().expect("non-utf8 temp path");
    assert_success(&fixture.pacfile(&["add-repo", "extra", archive]));
    assert!(!fixture.pacfile(&["add-repo", "extra", archive]).status.success());

    let config = fs::read_to_string(fixture.config_path()).expect("failed to read config");
    assert!(config.contains("name = \"extra\""), "{}", config);

    let update = fixture.pacfile(&["update", "extra"]);
    assert_success(&update);
    assert!(stdout(&update).contains("extra: 2 added"));
}
