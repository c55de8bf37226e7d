use std::path::Path;

use assert_cmd::Command;
use cdp_adapter::testing::{closed_port, FakeChrome};
use serde_json::Value;

fn cdpctl(workdir: &Path, config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cdpctl").unwrap();
    cmd.current_dir(workdir)
        .env_remove("RUST_LOG")
        .env_remove("CDPCTL_PORT")
        .env("CDP_NOLAUNCH_CHROME", "1")
        .arg("--config")
        .arg(config);
    cmd
}

fn workspace(yaml: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("cdpctl.yaml");
    std::fs::write(&config, yaml).unwrap();
    (dir, config)
}

#[test]
fn help_lists_subcommands() {
    let output = Command::cargo_bin("cdpctl")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    for name in ["call", "send", "ensure", "targets", "instances", "tasks", "serve", "config"] {
        assert!(text.contains(name), "help is missing {name}");
    }
}

#[test]
fn config_commands_report_and_validate() {
    let (dir, config) = workspace("chrome:\n  port: 9333\n");

    let output = cdpctl(dir.path(), &config).args(["config", "path"]).output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("cdpctl.yaml"));

    let output = cdpctl(dir.path(), &config)
        .args(["--output", "json", "config", "show"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let shown: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(shown["chrome"]["port"], 9333);
    assert_eq!(shown["http"]["port"], 8080);

    cdpctl(dir.path(), &config)
        .args(["config", "validate"])
        .assert()
        .success();

    std::fs::write(&config, "scheduler:\n  workers: 0\n").unwrap();
    cdpctl(dir.path(), &config)
        .args(["config", "validate"])
        .assert()
        .failure();
}

#[test]
fn call_prints_the_reply() {
    let chrome = FakeChrome::start();
    let (dir, config) = workspace(&format!("chrome:\n  port: {}\n", chrome.port()));

    let output = cdpctl(dir.path(), &config)
        .args(["--output", "json", "call", "Page.navigate", r#"{"url":"about:blank"}"#])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let reply: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(reply["result"]["method"], "Page.navigate");
    assert!(chrome.received_methods().contains(&"Page.navigate".to_string()));
}

#[test]
fn domain_error_sets_failure_exit_code() {
    let chrome = FakeChrome::start();
    let (dir, config) = workspace(&format!("chrome:\n  port: {}\n", chrome.port()));

    let output = cdpctl(dir.path(), &config)
        .args(["--output", "json", "call", "Test.error"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let reply: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(reply["error"]["message"], "boom");
}

#[test]
fn missing_browser_is_reported_with_the_port() {
    let port = closed_port();
    let (dir, config) = workspace(&format!("chrome:\n  port: {port}\n"));

    let output = cdpctl(dir.path(), &config)
        .args(["call", "Page.reload"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(&format!("port {port}")), "{stderr}");
}

#[test]
fn targets_and_new_page_use_the_http_endpoints() {
    let chrome = FakeChrome::start();
    let (dir, config) = workspace(&format!("chrome:\n  port: {}\n", chrome.port()));

    let output = cdpctl(dir.path(), &config).arg("targets").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("FAKE-PAGE"));

    let output = cdpctl(dir.path(), &config).arg("new-page").output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "FAKE-TARGET-1");
}
