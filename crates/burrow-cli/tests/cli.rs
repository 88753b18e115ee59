//! CLI argument validation and exit codes.

use assert_cmd::Command;
use std::time::Duration;

#[test]
fn missing_args_exit_one() {
    Command::cargo_bin("burrow")
        .unwrap()
        .assert()
        .failure()
        .code(1);
}

#[test]
fn invalid_port_exits_one() {
    Command::cargo_bin("burrow")
        .unwrap()
        .args(["not-a-port", "127.0.0.1:34567"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn unreachable_broker_exits_two() {
    // Bind then drop to get a loopback port with nothing listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    Command::cargo_bin("burrow")
        .unwrap()
        .args(["3000", &addr.to_string()])
        .timeout(Duration::from_secs(30))
        .assert()
        .failure()
        .code(2);
}

#[test]
fn help_exits_zero() {
    Command::cargo_bin("burrow")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}
