//! Integration tests for Gantry

use assert_cmd::{cargo::cargo_bin_cmd, Command};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Temporary config keeping every path gantry touches under one directory
struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let sandbox = Self {
            dir: TempDir::new().unwrap(),
        };
        sandbox.write_config(&[]);
        sandbox
    }

    fn write_config(&self, types: &[(&str, &Path)]) {
        let mut config = format!(
            "[worker]\nwork_dir = '{}'\n\n[cache]\nroot = '{}'\n\n[resource_types]\n",
            self.path().join("work").display(),
            self.path().join("volumes").display(),
        );
        for (name, script) in types {
            config.push_str(&format!("{} = '{}'\n", name, script.display()));
        }
        std::fs::write(self.config_path(), config).unwrap();
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn gantry(&self) -> Command {
        let mut cmd = gantry();
        cmd.env("GANTRY_CONFIG", self.config_path());
        cmd
    }
}

fn gantry() -> Command {
    cargo_bin_cmd!("gantry")
}

mod cli_tests {
    use super::*;
    use predicates::prelude::*;

    #[test]
    fn help_displays() {
        gantry()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("get"))
            .stdout(predicate::str::contains("cache"));
    }

    #[test]
    fn version_displays() {
        gantry()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("gantry"));
    }

    #[test]
    fn config_path_follows_env() {
        let sandbox = Sandbox::new();
        sandbox
            .gantry()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains(
                sandbox.config_path().display().to_string(),
            ));
    }

    #[test]
    fn config_show() {
        let sandbox = Sandbox::new();
        sandbox
            .gantry()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("[cache]"));
    }

    #[test]
    fn config_init_refuses_to_overwrite() {
        let sandbox = Sandbox::new();
        sandbox
            .gantry()
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn config_init_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        gantry()
            .env("GANTRY_CONFIG", &path)
            .args(["config", "init"])
            .assert()
            .success();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("log_format"));
    }

    #[test]
    fn invalid_config_reports_hint() {
        let sandbox = Sandbox::new();
        std::fs::write(sandbox.config_path(), "[cache\n").unwrap();

        sandbox
            .gantry()
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("gantry config init --force"));
    }

    #[test]
    fn cache_list_empty() {
        let sandbox = Sandbox::new();
        sandbox
            .gantry()
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache volumes found"));
    }

    #[test]
    fn cache_gc_empty() {
        let sandbox = Sandbox::new();
        sandbox
            .gantry()
            .args(["cache", "gc", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No expired volumes"));
    }

    #[test]
    fn get_unconfigured_type_fails() {
        let sandbox = Sandbox::new();
        sandbox
            .gantry()
            .args(["get", "git"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("no workers satisfy"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn get_rejects_malformed_source() {
        let sandbox = Sandbox::new();
        sandbox
            .gantry()
            .args(["get", "git", "--source", "no-equals-sign"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("KEY=VALUE"));
    }
}

#[cfg(unix)]
mod fetch_tests {
    use super::*;
    use predicates::prelude::*;
    use std::os::unix::fs::PermissionsExt;

    const FETCH_SCRIPT: &str = r#"#!/bin/sh
set -e
cat > /dev/null
echo "fetching into $1" >&2
mkdir -p "$1/docs"
echo hello > "$1/greeting.txt"
echo manual > "$1/docs/README"
echo '{"version":{"ref":"abc"},"metadata":[{"name":"author","value":"someone"}]}'
"#;

    const FAILING_SCRIPT: &str = r#"#!/bin/sh
cat > /dev/null
echo "remote unreachable" >&2
exit 3
"#;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn sandbox_with(name: &str, body: &str) -> Sandbox {
        let sandbox = Sandbox::new();
        let path = script(sandbox.path(), name, body);
        sandbox.write_config(&[(name, &path)]);
        sandbox
    }

    #[test]
    fn get_fetches_then_reuses_cache() {
        let sandbox = sandbox_with("echo", FETCH_SCRIPT);
        let first_out = sandbox.path().join("first");
        let second_out = sandbox.path().join("second");

        sandbox
            .gantry()
            .args(["get", "echo", "--source", "uri=local"])
            .arg("--output")
            .arg(&first_out)
            .assert()
            .success()
            .stdout(predicate::str::contains("found in cache").not())
            .stderr(predicate::str::contains("fetching into"))
            .stderr(predicate::str::contains("ref=abc"));

        assert_eq!(
            std::fs::read_to_string(first_out.join("greeting.txt")).unwrap(),
            "hello\n"
        );
        assert!(first_out.join("docs/README").is_file());

        sandbox
            .gantry()
            .args(["get", "echo", "--source", "uri=local"])
            .arg("--output")
            .arg(&second_out)
            .assert()
            .success()
            .stdout(predicate::str::contains(
                "using version of resource found in cache",
            ))
            .stderr(predicate::str::contains("fetching into").not())
            .stderr(predicate::str::contains("ref=abc"));

        assert_eq!(
            std::fs::read_to_string(second_out.join("greeting.txt")).unwrap(),
            "hello\n"
        );

        sandbox
            .gantry()
            .args(["cache", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"complete\""));
    }

    #[test]
    fn different_source_misses_cache() {
        let sandbox = sandbox_with("echo", FETCH_SCRIPT);

        for uri in ["uri=one", "uri=two"] {
            sandbox
                .gantry()
                .args(["get", "echo", "--source", uri])
                .assert()
                .success()
                .stderr(predicate::str::contains("fetching into"));
        }

        sandbox
            .gantry()
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::function(|out: &str| out.lines().count() == 2));
    }

    #[test]
    fn failing_script_exits_non_zero() {
        let sandbox = sandbox_with("broken", FAILING_SCRIPT);

        sandbox
            .gantry()
            .args(["get", "broken"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("remote unreachable"))
            .stderr(predicate::str::contains("exit status 3"));

        // A failed fetch never marks its volume reusable
        sandbox
            .gantry()
            .args(["cache", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"complete\"").not());
    }
}
