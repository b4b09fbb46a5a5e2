//! End-to-end runs of the `rollout` binary against a throwaway home.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use rollout::defaults::LockDefaults;
use rollout::release::ActivationLocks;
use serde_json::{json, Value};

fn rollout(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rollout"))
        .env("ROLLOUT_HOME", home)
        .args(args)
        .output()
        .unwrap()
}

fn response(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

fn create_target(home: &Path, id: &str, branch: &str) {
    let spec = json!({
        "id": id,
        "host": format!("{}.example.com", id),
        "user": "deploy",
        "deployPath": home.join("srv").join(id),
        "branch": branch,
    });
    let output = rollout(home, &["target", "create", "--json", &spec.to_string()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stdout));
}

/// An `ssh` stand-in that runs the remote command on this machine. Master
/// and control operations succeed without doing anything.
const LOCAL_SSH: &str = r#"#!/bin/sh
for arg in "$@"; do last="$arg"; done
case " $* " in
  *" -O "*|*" -M "*) exit 0 ;;
esac
exec sh -c "$last"
"#;

fn install_local_ssh(home: &Path) {
    let path = home.join("bin/ssh");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    // Written by a child so this process holds no descriptor to the script
    // when a concurrently spawned binary executes it.
    let mut writer = Command::new("sh")
        .args(["-c", "cat > \"$1\" && chmod 755 \"$1\"", "sh"])
        .arg(&path)
        .stdin(Stdio::piped())
        .spawn()
        .unwrap();
    writer
        .stdin
        .take()
        .unwrap()
        .write_all(LOCAL_SSH.as_bytes())
        .unwrap();
    assert!(writer.wait().unwrap().success());

    let config = json!({
        "defaults": { "transport": { "sshProgram": path, "backoffBaseMillis": 0 } }
    });
    std::fs::write(home.join("rollout.json"), config.to_string()).unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn deploy_over_ssh_uploads_builds_and_activates() {
    let home = tempfile::tempdir().unwrap();
    install_local_ssh(home.path());
    let env_file = home.path().join("app.env");
    std::fs::write(&env_file, "APP_ENV=production\n").unwrap();
    let deploy = home.path().join("srv/web");

    let spec = json!({
        "id": "web",
        "host": "web01.example.com",
        "user": "deploy",
        "deployPath": deploy,
        "steps": [
            { "id": "env", "type": "upload", "from": env_file, "to": "{{shared_path}}/.env" },
            { "id": "build", "type": "command", "run": "echo built > {{release_path}}/artifact" },
            { "id": "reload", "type": "command", "run": "touch {{deploy_path}}/reloaded", "phase": "activate" }
        ]
    });
    let created = rollout(home.path(), &["target", "create", "--json", &spec.to_string()]);
    assert!(created.status.success());

    let output = rollout(home.path(), &["deploy", "abc123", "--target", "web"]);

    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stdout));
    let body = response(&output);
    assert_eq!(body["data"]["result"]["runs"][0]["state"], "active");
    assert_eq!(
        std::fs::read_link(deploy.join("current")).unwrap(),
        deploy.join("releases/abc123")
    );
    assert!(deploy.join("releases/abc123/artifact").is_file());
    assert!(deploy.join("reloaded").exists());
    assert_eq!(
        std::fs::read_to_string(deploy.join("shared/.env")).unwrap(),
        "APP_ENV=production\n"
    );
}

#[test]
fn push_to_an_untracked_branch_is_a_successful_no_op() {
    let home = tempfile::tempdir().unwrap();
    create_target(home.path(), "web", "main");

    let output = rollout(
        home.path(),
        &[
            "trigger",
            "--event",
            r#"{"ref":"refs/heads/feature/x","after":"abc123"}"#,
        ],
    );

    assert_eq!(output.status.code(), Some(0));
    let body = response(&output);
    assert_eq!(body["success"], true);
    assert!(body["data"].get("result").is_none());
    assert!(!home.path().join("state/runs").exists());
}

#[test]
fn deleting_a_target_forgets_its_release_history() {
    let home = tempfile::tempdir().unwrap();
    create_target(home.path(), "web", "main");
    let ledger = home.path().join("state/releases/web.json");
    std::fs::create_dir_all(ledger.parent().unwrap()).unwrap();
    std::fs::write(
        &ledger,
        json!({ "targetId": "web", "releases": [], "history": [] }).to_string(),
    )
    .unwrap();

    let output = rollout(home.path(), &["target", "delete", "web"]);

    assert_eq!(output.status.code(), Some(0));
    assert!(!home.path().join("targets/web.json").exists());
    assert!(!ledger.exists());
}

#[cfg(unix)]
#[test]
fn deploy_is_refused_while_another_process_holds_the_target() {
    let home = tempfile::tempdir().unwrap();
    create_target(home.path(), "web", "main");

    let locks = ActivationLocks::new(home.path().join("state/locks"), &LockDefaults::default());
    let held = locks.acquire("web", "run-in-test-process").unwrap();

    let output = rollout(
        home.path(),
        &["deploy", "abc123", "--target", "web", "--wait-secs", "0"],
    );

    assert_eq!(output.status.code(), Some(30));
    let body = response(&output);
    let run = &body["data"]["result"]["runs"][0];
    assert_eq!(run["error"]["code"], "release.conflict");
    assert!(!home.path().join("srv/web/current").exists());

    drop(held);
}

#[test]
fn malformed_target_spec_is_a_validation_error() {
    let home = tempfile::tempdir().unwrap();
    let output = rollout(home.path(), &["target", "create", "--json", "{ not json"]);

    assert_eq!(output.status.code(), Some(2));
    let body = response(&output);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "validation.invalid_json");
}
