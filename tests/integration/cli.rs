//! The `corekeep` binary against a temporary root.

use assert_cmd::Command;
use corekeep::test_utils::{native_binary, write_tar_gz};
use corekeep::utils::HostPlatform;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct CliRoot {
    temp: TempDir,
}

impl CliRoot {
    fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
        }
    }

    fn root(&self) -> PathBuf {
        self.temp.path().join("root")
    }

    fn settings(&self) -> PathBuf {
        self.temp.path().join("settings/corekeep.toml")
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("corekeep").unwrap();
        cmd.env("COREKEEP_ROOT", self.root())
            .env("COREKEEP_CONFIG_PATH", self.settings())
            .env("NO_COLOR", "1")
            .env_remove("RUST_LOG");
        cmd
    }

    /// A binary for the machine running the tests.
    fn native_build(&self, name: &str) -> PathBuf {
        let host = HostPlatform::detect().unwrap();
        let path = self.temp.path().join(name);
        std::fs::write(&path, native_binary(&host)).unwrap();
        path
    }
}

fn install_local(cli: &CliRoot, path: &Path, version: &str) {
    cli.cmd()
        .args(["--no-progress", "install-file", path.to_str().unwrap()])
        .args(["--version", version, "--no-activate"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Installed {version} (not activated)")));
}

#[test]
fn test_config_path_follows_environment() {
    let cli = CliRoot::new();
    cli.cmd()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("settings/corekeep.toml"));
}

#[test]
fn test_config_init_then_show() {
    let cli = CliRoot::new();
    cli.cmd().args(["config", "init"]).assert().success();
    assert!(cli.settings().exists());

    cli.cmd()
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already exist"));

    cli.cmd()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 8317"));
}

#[test]
fn test_invalid_settings_are_reported() {
    let cli = CliRoot::new();
    std::fs::create_dir_all(cli.settings().parent().unwrap()).unwrap();
    std::fs::write(cli.settings(), "port = 0\n").unwrap();

    cli.cmd()
        .arg("versions")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("CONFIG_ERROR"));
}

#[test]
fn test_versions_on_empty_root() {
    let cli = CliRoot::new();
    cli.cmd()
        .arg("versions")
        .assert()
        .success()
        .stdout(predicate::str::contains("No versions installed"));
}

#[test]
fn test_install_file_use_and_list() {
    let cli = CliRoot::new();
    let build = cli.native_build("core-build");
    install_local(&cli, &build, "v1.0.0-local");

    cli.cmd()
        .args(["versions", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"version\": \"v1.0.0-local\""))
        .stdout(predicate::str::contains("\"current\": false"));

    cli.cmd()
        .args(["use", "v1.0.0-local"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Current version is now v1.0.0-local"));

    cli.cmd()
        .args(["status", "--no-probe"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Current: v1.0.0-local"));
}

#[test]
fn test_install_file_from_archive() {
    let cli = CliRoot::new();
    let host = HostPlatform::detect().unwrap();
    let archive = cli.temp.path().join("core.tar.gz");
    let executable = host.executable_name("cli-proxy-api");
    write_tar_gz(&archive, &[(executable.as_str(), native_binary(&host).as_slice())]);

    install_local(&cli, &archive, "v2.0.0");
    assert!(cli.root().join("versions/v2.0.0").join(&executable).exists());
}

#[test]
fn test_install_file_rejects_non_executable() {
    let cli = CliRoot::new();
    let notes = cli.temp.path().join("notes.txt");
    std::fs::write(&notes, "definitely not a binary").unwrap();

    cli.cmd()
        .args(["--no-progress", "install-file", notes.to_str().unwrap()])
        .args(["--version", "v0.0.1", "--no-activate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("INVALID_EXECUTABLE"));
    assert!(!cli.root().join("versions/v0.0.1").exists());
}

#[test]
fn test_use_unknown_version() {
    let cli = CliRoot::new();
    cli.cmd()
        .args(["use", "v9.9.9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("VERSION_NOT_INSTALLED"));
}

#[test]
fn test_rollback_without_known_good() {
    let cli = CliRoot::new();
    cli.cmd()
        .arg("rollback")
        .assert()
        .failure()
        .stderr(predicate::str::contains("ROLLBACK_FAILED"));
}

#[test]
fn test_offline_releases_without_cache() {
    let cli = CliRoot::new();
    cli.cmd()
        .args(["releases", "--offline"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("CACHE_MISSING"));
}

#[test]
fn test_logs_before_first_start() {
    let cli = CliRoot::new();
    cli.cmd()
        .args(["logs", "--lines", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No log at"));
}

#[test]
fn test_status_reports_nothing_installed() {
    let cli = CliRoot::new();
    cli.cmd()
        .args(["status", "--no-probe"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Current: none"))
        .stdout(predicate::str::contains("Health failures: 0/3"));
}
