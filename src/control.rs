//! Control channel between CLI tools and the resident daemon.
//!
//! A line-oriented JSON protocol over a Unix stream socket in the runtime
//! directory. Commands that merely observe reply immediately; start and
//! stop requests may be deferred — the connected stream is parked in a
//! `Blocked::Control` record and answered when the instance finishes its
//! transition.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// Socket file under the runtime directory.
pub fn socket_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("control.sock")
}

/// Lock file guaranteeing one daemon per runtime directory.
pub fn lock_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("daemon.lock")
}

/// Message sent from CLI invocations (and the SysV shim) to the daemon.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Inject an event into the queue.
    EmitEvent {
        /// Event name.
        name: String,
        /// KEY=VALUE bindings carried by the event.
        #[serde(default)]
        env: Vec<String>,
        /// Wait for the event to finish handling before replying.
        #[serde(default)]
        wait: bool,
    },
    /// Start an instance of a job class.
    Start {
        /// Class name.
        job: String,
        /// Environment used for instance-name expansion and the start.
        #[serde(default)]
        env: Vec<String>,
        /// Wait for the instance to be running (or finished, for tasks).
        #[serde(default)]
        wait: bool,
    },
    /// Stop an instance.
    Stop {
        /// Class name.
        job: String,
        /// Environment used for instance-name expansion.
        #[serde(default)]
        env: Vec<String>,
        /// Wait for the instance to reach its terminal state.
        #[serde(default)]
        wait: bool,
    },
    /// Stop then start an instance.
    Restart {
        /// Class name.
        job: String,
    },
    /// Send a job's reload signal to its main process.
    Reload {
        /// Class name.
        job: String,
    },
    /// Fetch a snapshot of every instance.
    Status,
    /// List installed job classes.
    ListJobs,
    /// Re-read configuration directories.
    ReloadConfiguration,
    /// Shut the daemon down.
    Shutdown,
}

/// One instance in a status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Class name.
    pub class: String,
    /// Instance name.
    pub instance: String,
    /// Current goal.
    pub goal: String,
    /// Current state.
    pub state: String,
    /// Live pids keyed by role name.
    #[serde(default)]
    pub pids: Vec<(String, i32)>,
}

/// A full status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
    /// Every live instance.
    pub jobs: Vec<JobSnapshot>,
}

/// Response sent by the daemon.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command completed.
    Ok,
    /// Command completed with a status message.
    Message(String),
    /// Command failed.
    Error(String),
    /// Status payload.
    Status(StatusSnapshot),
    /// Installed class names.
    Jobs(Vec<String>),
}

/// Takes the exclusive daemon lock for a runtime directory.
pub fn lock_runtime_dir(runtime_dir: &Path) -> Result<File, ControlError> {
    fs::create_dir_all(runtime_dir)?;
    let file = File::create(lock_path(runtime_dir))?;
    file.try_lock_exclusive().map_err(|_| {
        ControlError::Server("another daemon owns this runtime directory".into())
    })?;
    Ok(file)
}

/// Binds the control socket, replacing any stale file.
pub fn bind(runtime_dir: &Path) -> Result<UnixListener, ControlError> {
    fs::create_dir_all(runtime_dir)?;
    let path = socket_path(runtime_dir);
    if path.exists() {
        fs::remove_file(&path)?;
    }
    let listener = UnixListener::bind(&path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Sends a command to the daemon and waits for a response.
pub fn send_command(
    runtime_dir: &Path,
    command: &ControlCommand,
) -> Result<ControlResponse, ControlError> {
    let path = socket_path(runtime_dir);
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = UnixStream::connect(path)?;
    let payload = serde_json::to_vec(command)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    if response_line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    let response: ControlResponse = serde_json::from_str(response_line.trim())?;
    if let ControlResponse::Error(message) = &response {
        return Err(ControlError::Server(message.clone()));
    }
    Ok(response)
}

/// Reads one command from a connected client.
pub fn read_command(stream: &mut UnixStream) -> Result<ControlCommand, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "empty control command",
        )));
    }
    Ok(serde_json::from_str(line.trim())?)
}

/// Writes a response to a connected client.
pub fn write_response(
    stream: &mut UnixStream,
    response: &ControlResponse,
) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// Removes the socket and lock files.
pub fn cleanup(runtime_dir: &Path) {
    let _ = fs::remove_file(socket_path(runtime_dir));
    let _ = fs::remove_file(lock_path(runtime_dir));
}
