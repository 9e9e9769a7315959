//! Smoke tests -- verify the binary runs and key modules load.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("apipatrol")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Scheduled HTTP API test automation",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("apipatrol")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("apipatrol"));
}

#[test]
fn test_serve_subcommand_exists() {
    Command::cargo_bin("apipatrol")
        .unwrap()
        .args(["serve", "--help"])
        .assert()
        .success();
}

#[test]
fn test_run_subcommand_exists() {
    Command::cargo_bin("apipatrol")
        .unwrap()
        .args(["run", "--help"])
        .assert()
        .success();
}

#[test]
fn test_timer_list_subcommand_exists() {
    Command::cargo_bin("apipatrol")
        .unwrap()
        .args(["timer", "list", "--help"])
        .assert()
        .success();
}

#[test]
fn test_report_list_subcommand_exists() {
    Command::cargo_bin("apipatrol")
        .unwrap()
        .args(["report", "list", "--help"])
        .assert()
        .success();
}
