//! Binary-level checks: exit codes, config rendering and one-shot retention

use assert_cmd::Command;
use chrono::{Duration, SecondsFormat, Utc};
use predicates::prelude::*;
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct GateFixture {
    dir: TempDir,
}

impl GateFixture {
    fn new(api_url: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let validation = dir.path().join("validation");
        let review = dir.path().join("review");
        std::fs::create_dir_all(&validation).unwrap();
        std::fs::create_dir_all(&review).unwrap();
        std::fs::write(
            dir.path().join("fleetgate.toml"),
            format!(
                "[coordinator]\napi_url = '{api_url}'\n\n[gate]\nvalidation_dir = '{}'\nreview_dir = '{}'\n",
                validation.display(),
                review.display()
            ),
        )
        .unwrap();
        Self { dir }
    }

    fn write_signals(&self, overall: &str, review: &str) {
        let at = (Utc::now() - Duration::minutes(1)).to_rfc3339_opts(SecondsFormat::Secs, true);
        write_json(
            &self.dir.path().join("validation/web.json"),
            json!({"project": "web", "timestamp": at, "overallStatus": overall, "checks": {}}),
        );
        write_json(
            &self.dir.path().join("review/web.json"),
            json!({
                "status": review,
                "criticalIssueCount": 0,
                "majorIssueCount": 2,
                "minorIssueCount": 0,
                "timestamp": at,
            }),
        );
    }

    fn gate_check(&self) -> assert_cmd::assert::Assert {
        Command::cargo_bin("fleetgate")
            .unwrap()
            .current_dir(self.dir.path())
            .env_remove("FLEETGATE_CONFIG_FILE")
            .args(["gate-check", "--project", "web"])
            .assert()
    }
}

fn write_json(path: &Path, value: serde_json::Value) {
    std::fs::write(path, serde_json::to_vec(&value).unwrap()).unwrap();
}

async fn alert_server(alerts: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/alerts"))
        .and(query_param("minSeverity", "error"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok", "data": alerts})))
        .mount(&server)
        .await;
    server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gate_check_allows_clean_project() {
    let server = alert_server(json!([])).await;
    let fx = GateFixture::new(&server.uri());
    fx.write_signals("passed", "approved");

    fx.gate_check()
        .code(0)
        .stdout(predicate::str::starts_with("ALLOW: validation passed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gate_check_warns_on_needs_changes() {
    let server = alert_server(json!([])).await;
    let fx = GateFixture::new(&server.uri());
    fx.write_signals("passed", "needs_changes");

    fx.gate_check()
        .code(2)
        .stdout(predicate::str::starts_with("ALLOW-WITH-WARNING: review needs changes"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gate_check_denies_on_recent_critical_alert() {
    let at = Utc::now() - Duration::minutes(5);
    let server = alert_server(json!([{
        "id": "a-1",
        "source": "supervisor",
        "severity": "critical",
        "message": "worker builder crashed 3 times in a row; circuit breaker open",
        "timestamp": at,
        "fingerprint": "f00d",
        "occurrences": 1,
    }]))
    .await;
    let fx = GateFixture::new(&server.uri());
    fx.write_signals("passed", "approved");

    fx.gate_check()
        .code(1)
        .stdout(predicate::str::starts_with("DENY: unresolved alert"))
        .stdout(predicate::str::contains("circuit breaker open"));
}

#[test]
fn test_gate_check_fails_closed_when_coordinator_unreachable() {
    let fx = GateFixture::new("http://127.0.0.1:1");
    fx.write_signals("passed", "approved");

    fx.gate_check()
        .code(1)
        .stdout(predicate::str::contains("DENY: unresolved alert: alert signal unavailable"));
}

#[test]
fn test_gate_check_denies_failed_validation_first() {
    let fx = GateFixture::new("http://127.0.0.1:1");
    fx.write_signals("failed", "approved");

    fx.gate_check()
        .code(1)
        .stdout(predicate::str::starts_with("DENY: validation failed"));
}

#[test]
fn test_gate_check_with_broken_config_denies() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("fleetgate.toml"), "[gate\nvalidation_dir = ").unwrap();

    Command::cargo_bin("fleetgate")
        .unwrap()
        .current_dir(dir.path())
        .env_remove("FLEETGATE_CONFIG_FILE")
        .args(["gate-check", "--project", "web"])
        .assert()
        .code(1)
        .stdout(predicate::str::starts_with("DENY:"));
}

#[test]
fn test_config_show_applies_env_overrides() {
    let dir = TempDir::new().unwrap();
    Command::cargo_bin("fleetgate")
        .unwrap()
        .current_dir(dir.path())
        .env_remove("FLEETGATE_CONFIG_FILE")
        .env("FLEETGATE_RETENTION__MAX_RETAINED_SNAPSHOTS", "4")
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[coordinator]"))
        .stdout(predicate::str::contains("max_retained_snapshots = 4"));
}

#[test]
fn test_missing_explicit_config_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    Command::cargo_bin("fleetgate")
        .unwrap()
        .current_dir(dir.path())
        .args(["--config", "absent.toml", "config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_backup_then_throttled_backup() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("web");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(project.join("lib.rs"), "pub fn answer() -> u32 { 42 }\n").unwrap();
    std::fs::write(
        dir.path().join("fleetgate.toml"),
        format!(
            "[retention]\nbackup_root = '{}'\n\n[[retention.projects]]\nname = 'web'\npath = '{}'\n",
            dir.path().join("backups").display(),
            project.display()
        ),
    )
    .unwrap();

    let backup = || {
        Command::cargo_bin("fleetgate")
            .unwrap()
            .current_dir(dir.path())
            .env_remove("FLEETGATE_CONFIG_FILE")
            .args(["backup", "--project", "web"])
            .assert()
    };
    backup()
        .success()
        .stdout(predicate::str::is_match(r"^web: snapshot \d{8}T\d{6}Z-[0-9a-f]{8} created").unwrap());
    backup()
        .success()
        .stdout(predicate::str::contains("web: backup skipped"));
    assert!(dir.path().join("backups/web/.backup-marker.json").exists());
}

#[test]
fn test_unknown_project_is_reported() {
    let dir = TempDir::new().unwrap();
    Command::cargo_bin("fleetgate")
        .unwrap()
        .current_dir(dir.path())
        .env_remove("FLEETGATE_CONFIG_FILE")
        .args(["compact", "--project", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("fleetgate")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("gate-check"))
        .stdout(predicate::str::contains("backup"));
}
