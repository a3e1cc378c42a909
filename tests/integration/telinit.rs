//! CLI surface of the SysV-compat shim and the daemon binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn running_as_root() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("Uid:"))
                .and_then(|line| line.split_whitespace().nth(1).map(|uid| uid == "0"))
        })
        .unwrap_or(false)
}

#[test]
fn telinit_documents_the_runlevel_argument() {
    Command::cargo_bin("ember-telinit")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Change runlevel"))
        .stdout(predicate::str::contains("RUNLEVEL"));
}

#[test]
fn telinit_accepts_and_ignores_compat_options() {
    // -t and -e must parse; whether the command then succeeds depends on
    // privileges and a running daemon.
    let assert = Command::cargo_bin("ember-telinit")
        .unwrap()
        .args(["-t", "5", "-e", "FOO=bar", "q"])
        .assert();

    if running_as_root() {
        // Parses fine; fails only because no daemon is listening.
        assert
            .failure()
            .stderr(predicate::str::contains("control socket").or(
                predicate::str::contains("daemon"),
            ));
    } else {
        assert
            .failure()
            .stderr(predicate::str::contains("need to be root"));
    }
}

#[test]
fn telinit_requires_root() {
    if running_as_root() {
        return;
    }
    Command::cargo_bin("ember-telinit")
        .unwrap()
        .arg("2")
        .assert()
        .failure()
        .stderr(predicate::str::contains("need to be root"));
}

#[test]
fn unknown_runlevels_are_a_silent_no_op() {
    if !running_as_root() {
        return;
    }
    Command::cargo_bin("ember-telinit")
        .unwrap()
        .arg("z")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn daemon_advertises_its_flags() {
    Command::cargo_bin("emberd")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--confdir"))
        .stdout(predicate::str::contains("--state-fd"))
        .stdout(predicate::str::contains("--default-console"))
        .stdout(predicate::str::contains("--startup-event"));
}
