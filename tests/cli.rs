use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};

fn anka_provision() -> assert_cmd::Command {
    cargo_bin_cmd!("anka-provision").into()
}

fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    let config_path = dir.path().join("anka.toml");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(f, "{body}").unwrap();
    config_path
}

#[test]
fn help_works() {
    anka_provision()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Build macOS VM templates"));
}

#[test]
fn missing_config_shows_error() {
    anka_provision()
        .args(["--config", "/nonexistent/anka.toml", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn validation_requires_a_source() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, "[vm]\nname = \"target\"\n");

    anka_provision()
        .args(["--config", config_path.to_str().unwrap(), "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "source.installer or source.vm_name must be specified",
        ));
}

#[test]
fn validation_rejects_conflicting_htt_flags() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        r#"
[source]
vm_name = "base"

[vm]
enable_htt = true
disable_htt = true
"#,
    );

    anka_provision()
        .args(["--config", config_path.to_str().unwrap(), "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot both be set"));
}

#[test]
fn validation_rejects_bad_disk_size() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        r#"
[source]
vm_name = "base"

[vm]
disk_size = "40 gigs"
"#,
    );

    anka_provision()
        .args(["--config", config_path.to_str().unwrap(), "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid disk size"));
}

#[test]
fn validate_accepts_full_config() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        r#"
[source]
vm_name = "base"
tag = "v1"

[vm]
name = "ci-runner"
disk_size = "80G"
ram_size = "8G"
cpu_count = 4
boot_delay = "30s"

[display]
controller = "pg"
resolution = "1920x1080"

[[port_forwarding]]
guest_port = 22
host_port = 2222

[registry]
remote = "main"

[push]
tag = "nightly"

[provision]
inline = ["echo hello"]
"#,
    );

    anka_provision()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "--output",
            "plain",
            "validate",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("valid clone configuration"));
}

#[cfg(unix)]
mod fake_tool {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Shell stand-in for the anka CLI. Every invocation is appended to
    /// `$ANKA_FAKE_LOG`, which only reaches the script through env forwarding.
    const SCRIPT: &str = r#"#!/bin/sh
echo "$*" >> "$ANKA_FAKE_LOG"
if [ -n "$FAKE_SECRET" ]; then
  echo '{"status":"ERROR","message":"environment leaked","code":1,"exception_type":"Test"}'
  exit 1
fi
[ "$1" = "--machine-readable" ] && shift
[ "$1" = "--debug" ] && shift
case "$1" in
  version)
    echo '{"status":"OK","body":{"product":"Anka Develop","version":"3.4.0","build":"1"}}' ;;
  show)
    if [ "$2" = "crash" ]; then
      echo "segmentation fault" >&2
      exit 2
    fi
    if [ "$2" = "segv" ]; then
      echo "starting"
      echo "Segmentation fault"
      exit 139
    fi
    if [ "$2" = "missing" ]; then
      echo '{"status":"ERROR","message":"vm missing not found","code":3,"exception_type":"VMNotFoundException"}'
      exit 3
    fi
    echo "Resolving $2"
    echo "{\"status\":\"OK\",\"body\":{\"uuid\":\"$2-uuid\",\"name\":\"$2\",\"status\":\"stopped\",\"cpu_cores\":2,\"ram\":\"4G\",\"hard_drive\":0}}" ;;
  describe)
    echo "{\"status\":\"OK\",\"body\":{\"name\":\"$2\",\"uuid\":\"$2-uuid\"}}" ;;
  license)
    echo '{"status":"OK","body":{"license_type":"com.veertu.anka.run"}}' ;;
  clone|start|suspend|stop|delete)
    echo '{"status":"OK","body":{}}' ;;
  run)
    case "$*" in
      *uname*) echo "23.4.0" ;;
      *sw_vers*) echo "14.4.1" ;;
      *"exit 4"*) exit 4 ;;
      *) echo "provisioned" ;;
    esac ;;
  *)
    echo "{\"status\":\"ERROR\",\"message\":\"unexpected $*\",\"code\":1,\"exception_type\":\"Test\"}"
    exit 1 ;;
esac
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        tool: PathBuf,
        log: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let tool = dir.path().join("anka");
            std::fs::write(&tool, SCRIPT).unwrap();
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
            let log = dir.path().join("calls.log");
            std::fs::create_dir(dir.path().join("tmp")).unwrap();
            Self { dir, tool, log }
        }

        fn config(&self, extra: &str) -> PathBuf {
            let body = format!(
                "[source]\nvm_name = \"base\"\n\n[vm]\nname = \"target\"\nboot_delay = \"0\"\n\n[advanced]\ntool = \"{}\"\n{extra}",
                self.tool.display()
            );
            let path = self.dir.path().join("anka.toml");
            std::fs::write(&path, body).unwrap();
            path
        }

        fn cmd(&self) -> assert_cmd::Command {
            let mut cmd = anka_provision();
            cmd.env("ANKA_FAKE_LOG", &self.log)
                .env("FAKE_SECRET", "")
                .env("HOME", self.dir.path())
                .env("XDG_DATA_HOME", self.dir.path().join("data"))
                .env("ANKA_PROVISION_TMP_DIR", self.dir.path().join("tmp"));
            cmd
        }

        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(&self.log)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn tmp_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir.join("tmp")).unwrap().next().is_none()
    }

    #[test]
    fn show_parses_envelope_after_progress() {
        let fx = Fixture::new();
        let config = fx.config("");
        fx.cmd()
            .args(["--config", config.to_str().unwrap(), "show", "base"])
            .assert()
            .success()
            .stdout(predicate::str::contains("VM 'base': stopped"))
            .stdout(predicate::str::contains("UUID: base-uuid"));
        assert_eq!(fx.calls(), vec!["--machine-readable show base"]);
    }

    #[test]
    fn show_and_delete_only_need_the_tool() {
        let fx = Fixture::new();
        let config = fx.dir.path().join("tool-only.toml");
        std::fs::write(
            &config,
            format!("[advanced]\ntool = \"{}\"\n", fx.tool.display()),
        )
        .unwrap();

        fx.cmd()
            .args(["--config", config.to_str().unwrap(), "show", "base"])
            .assert()
            .success()
            .stdout(predicate::str::contains("VM 'base': stopped"));
        fx.cmd()
            .args(["--config", config.to_str().unwrap(), "delete", "base"])
            .assert()
            .success();
        assert_eq!(
            fx.calls(),
            vec!["--machine-readable show base", "--machine-readable delete --yes base"]
        );
    }

    #[test]
    fn only_path_and_anka_variables_are_forwarded() {
        let fx = Fixture::new();
        let config = fx.config("");
        fx.cmd()
            .env("FAKE_SECRET", "hunter2")
            .args(["--config", config.to_str().unwrap(), "show", "base"])
            .assert()
            .success();
    }

    #[test]
    fn tool_error_is_reported() {
        let fx = Fixture::new();
        let config = fx.config("");
        fx.cmd()
            .args(["--config", config.to_str().unwrap(), "show", "missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("vm missing not found"));
    }

    #[test]
    fn crash_without_envelope_is_a_transport_error() {
        let fx = Fixture::new();
        let config = fx.config("");
        fx.cmd()
            .args(["--config", config.to_str().unwrap(), "show", "crash"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("without machine readable output"))
            .stderr(predicate::str::contains("segmentation fault"));
    }

    #[test]
    fn garbage_before_crash_is_a_transport_error() {
        let fx = Fixture::new();
        let config = fx.config("");
        fx.cmd()
            .args(["--config", config.to_str().unwrap(), "show", "segv"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("exited with"))
            .stderr(predicate::str::contains("without machine readable output"));
    }

    #[test]
    fn show_json_output() {
        let fx = Fixture::new();
        let config = fx.config("");
        fx.cmd()
            .args([
                "--config",
                config.to_str().unwrap(),
                "--output",
                "json",
                "show",
                "base",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"uuid\":\"base-uuid\""));
    }

    #[test]
    fn clone_build_end_to_end() {
        let fx = Fixture::new();
        let config = fx.config("\n[provision]\ninline = [\"echo hi\"]\n");
        fx.cmd()
            .args([
                "--config",
                config.to_str().unwrap(),
                "--output",
                "plain",
                "build",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Anka VM target (target-uuid)"))
            .stdout(predicate::str::contains("OSVersion: 14.4.1"))
            .stdout(predicate::str::contains("DarwinVersion: 23.4.0"));

        let calls = fx.calls();
        assert_eq!(calls.first().map(String::as_str), Some("--machine-readable version"));
        assert!(calls.contains(&"--machine-readable clone base-uuid target".to_string()));
        assert!(calls.contains(&"run target bash -c echo hi".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("--machine-readable suspend target"));
        assert!(tmp_is_empty(fx.dir.path()));
    }

    #[test]
    fn failed_provisioning_deletes_the_clone() {
        let fx = Fixture::new();
        let config = fx.config("\n[provision]\ninline = [\"exit 4\"]\n");
        fx.cmd()
            .args([
                "--config",
                config.to_str().unwrap(),
                "--output",
                "plain",
                "build",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("exited with code 4"));

        let calls = fx.calls();
        assert_eq!(calls.last().map(String::as_str), Some("--machine-readable delete --yes target"));
        assert!(!calls.iter().any(|c| c.contains("suspend")));
        assert!(tmp_is_empty(fx.dir.path()));
    }
}
