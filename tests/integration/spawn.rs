//! Real spawns through the error-pipe protocol: success is a clean close,
//! failure is a structured record, and drip-fed scripts reach the shell.

use std::time::{Duration, Instant};

use emberd::error::SpawnErrorKind;
use emberd::job_class::{ConsoleType, JobClass};
use emberd::process::{ProcessRole, ProcessSpec};
use emberd::spawn::{self, ErrorPipeEvent, SpawnRequest};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tempfile::tempdir;

fn quiet_class(name: &str, command: ProcessSpec) -> JobClass {
    let mut class = JobClass::new(name);
    class.console = ConsoleType::None;
    class.processes.insert(ProcessRole::Main, command);
    class
}

fn request<'a>(class: &'a JobClass, log_path: std::path::PathBuf) -> SpawnRequest<'a> {
    SpawnRequest {
        class,
        instance: "",
        role: ProcessRole::Main,
        env: &[],
        trace: false,
        log_path,
        no_log: true,
        session_chroot: None,
        reset_console: false,
        system_mode: false,
    }
}

/// Polls the error pipe until the child reports, with a deadline so a
/// wedged child fails the test instead of hanging it.
fn await_pipe(fd: i32) -> ErrorPipeEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match spawn::read_error_pipe(fd) {
            ErrorPipeEvent::Pending => {
                assert!(Instant::now() < deadline, "spawn never reported");
                std::thread::sleep(Duration::from_millis(10));
            }
            event => return event,
        }
    }
}

fn await_exit(pid: i32) -> WaitStatus {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                assert!(Instant::now() < deadline, "child never exited");
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(status) => return status,
            Err(err) => panic!("waitpid failed: {err}"),
        }
    }
}

#[test]
fn successful_exec_closes_the_pipe_without_data() {
    let dir = tempdir().expect("tempdir");
    let class = quiet_class("truthy", ProcessSpec::new(false, "/bin/true"));
    let outcome =
        spawn::spawn(&request(&class, dir.path().join("truthy.log"))).expect("spawn");

    assert_eq!(await_pipe(outcome.error_fd), ErrorPipeEvent::Success);
    unsafe { libc::close(outcome.error_fd) };

    match await_exit(outcome.pid) {
        WaitStatus::Exited(_, code) => assert_eq!(code, 0),
        other => panic!("unexpected wait status {other:?}"),
    }
}

#[test]
fn missing_binary_reports_a_structured_exec_error() {
    let dir = tempdir().expect("tempdir");
    let class = quiet_class(
        "ghost",
        ProcessSpec::new(false, "/nonexistent/binary --flag"),
    );
    let outcome =
        spawn::spawn(&request(&class, dir.path().join("ghost.log"))).expect("spawn");

    match await_pipe(outcome.error_fd) {
        ErrorPipeEvent::Failed(err) => {
            assert_eq!(err.kind, SpawnErrorKind::Exec);
            assert!(err.to_string().starts_with("unable to execute"));
        }
        other => panic!("expected a failure record, got {other:?}"),
    }
    unsafe { libc::close(outcome.error_fd) };

    // The child _exits 255 after reporting.
    match await_exit(outcome.pid) {
        WaitStatus::Exited(_, code) => assert_eq!(code, 255),
        other => panic!("unexpected wait status {other:?}"),
    }
}

#[test]
fn multi_line_scripts_are_fed_through_the_reserved_descriptor() {
    let dir = tempdir().expect("tempdir");
    let marker = dir.path().join("ran");
    let script = format!(
        "touch {}\nexit 7\n",
        marker.display()
    );
    let class = quiet_class("scripted", ProcessSpec::new(true, script));
    let outcome =
        spawn::spawn(&request(&class, dir.path().join("scripted.log"))).expect("spawn");

    assert!(outcome.script.is_some(), "multi-line body is drip-fed");
    let shell_fd = outcome.shell_fd.expect("feeder pipe");

    assert_eq!(await_pipe(outcome.error_fd), ErrorPipeEvent::Success);
    unsafe { libc::close(outcome.error_fd) };

    spawn::feed_script(shell_fd, &outcome.script.unwrap()).expect("feed");

    match await_exit(outcome.pid) {
        WaitStatus::Exited(_, code) => assert_eq!(code, 7, "script body ran"),
        other => panic!("unexpected wait status {other:?}"),
    }
    assert!(marker.exists(), "script side effects happened");
}

#[test]
fn single_line_commands_with_shell_characters_use_dash_c() {
    let dir = tempdir().expect("tempdir");
    let marker = dir.path().join("mark");
    let class = quiet_class(
        "shelly",
        ProcessSpec::new(false, format!("echo done > {}", marker.display())),
    );
    let outcome =
        spawn::spawn(&request(&class, dir.path().join("shelly.log"))).expect("spawn");

    assert!(outcome.script.is_none(), "single line needs no feeder");
    assert_eq!(await_pipe(outcome.error_fd), ErrorPipeEvent::Success);
    unsafe { libc::close(outcome.error_fd) };

    match await_exit(outcome.pid) {
        WaitStatus::Exited(_, code) => assert_eq!(code, 0),
        other => panic!("unexpected wait status {other:?}"),
    }
    let contents = std::fs::read_to_string(&marker).expect("marker written");
    assert_eq!(contents.trim(), "done");
}
