//! Loading job definition directories from disk.

use std::fs;

use emberd::config::load_job_dir;
use emberd::job_class::{ConsoleType, ExpectType};
use emberd::process::ProcessRole;
use tempfile::tempdir;

#[test]
fn loads_a_directory_of_job_files() {
    let dir = tempdir().expect("tempdir");

    fs::write(
        dir.path().join("hello.conf"),
        "# simple task\n\
         task\n\
         exec /bin/echo hi\n\
         start on startup\n",
    )
    .unwrap();

    fs::write(
        dir.path().join("server.conf"),
        "description \"a daemonising server\"\n\
         exec /usr/sbin/server --daemonise\n\
         expect daemon\n\
         start on started hello\n\
         stop on runlevel [06]\n\
         respawn\n",
    )
    .unwrap();

    let (classes, failures) = load_job_dir(dir.path(), ConsoleType::Log);
    assert!(failures.is_empty(), "both files parse: {failures:?}");
    assert_eq!(classes.len(), 2);

    // Directory order is stable: name-sorted.
    assert_eq!(classes[0].name, "hello");
    assert_eq!(classes[1].name, "server");

    let hello = &classes[0];
    assert!(hello.task);
    assert_eq!(
        hello.process(ProcessRole::Main).unwrap().command,
        "/bin/echo hi"
    );
    assert_eq!(
        hello.start_on.as_ref().unwrap().collapse(),
        "startup"
    );

    let server = &classes[1];
    assert_eq!(server.expect, ExpectType::Daemon);
    assert!(server.respawn);
    assert_eq!(
        server.stop_on.as_ref().unwrap().collapse(),
        "runlevel [06]"
    );
}

#[test]
fn a_broken_file_is_rejected_wholesale() {
    let dir = tempdir().expect("tempdir");

    fs::write(
        dir.path().join("broken.conf"),
        "exec /bin/true\nstart on and startup\n",
    )
    .unwrap();
    fs::write(dir.path().join("fine.conf"), "exec /bin/true\n").unwrap();

    let (classes, failures) = load_job_dir(dir.path(), ConsoleType::Log);
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0].name, "fine");
    assert_eq!(failures.len(), 1);
    assert!(failures[0].0.ends_with("broken.conf"));
    assert!(
        failures[0].1.to_string().contains("line 2"),
        "error names the line: {}",
        failures[0].1
    );
}

#[test]
fn default_console_applies_only_without_a_stanza() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("quiet.conf"), "exec /bin/true\n").unwrap();
    fs::write(
        dir.path().join("loud.conf"),
        "exec /bin/true\nconsole output\n",
    )
    .unwrap();

    let (classes, _) = load_job_dir(dir.path(), ConsoleType::None);
    let loud = classes.iter().find(|c| c.name == "loud").unwrap();
    let quiet = classes.iter().find(|c| c.name == "quiet").unwrap();
    assert_eq!(quiet.console, ConsoleType::None);
    assert_eq!(loud.console, ConsoleType::Output);
}
