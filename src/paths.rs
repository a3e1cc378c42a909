//! Constants and well-known paths for the emberd daemon.
//!
//! This module centralizes the magic numbers, reserved descriptors, and
//! event names used throughout the daemon.

use std::time::Duration;

// ============================================================================
// Configuration and Log Locations
// ============================================================================

/// System-mode directory searched for `<name>.conf` job definitions.
pub const DEFAULT_CONFDIR: &str = "/etc/emberd";

/// Subdirectory of `$XDG_CONFIG_HOME` (and each `$XDG_CONFIG_DIRS` entry)
/// searched in user mode.
pub const USER_CONFDIR: &str = "emberd";

/// System-mode directory for per-job output logs.
pub const DEFAULT_LOGDIR: &str = "/var/log/emberd";

/// Extension a job definition file must carry to be considered.
pub const CONF_EXT: &str = "conf";

// ============================================================================
// Shell Execution
// ============================================================================

/// Shell used for script stanzas and commands with shell metacharacters.
pub const SHELL: &str = "/bin/sh";

/// Reserved descriptor a multi-line script is fed through; the shell reads
/// it back via `/proc/self/fd/N`.
pub const SCRIPT_FD: i32 = 9;

/// Characters that force a command to be run under the shell.
pub const SHELL_CHARS: &str = "~`!$^&*()=|\\{}[];\"'<>?";

// ============================================================================
// Console Devices
// ============================================================================

/// Console device used by the `output` and `owner` console policies.
pub const CONSOLE: &str = "/dev/console";

/// Sink for the `none` console policy and for stdin everywhere else.
pub const DEV_NULL: &str = "/dev/null";

// ============================================================================
// Job Defaults
// ============================================================================

/// Seconds to wait after the first kill signal before sending `SIGKILL`.
pub const JOB_DEFAULT_KILL_TIMEOUT: u64 = 5;

/// Number of respawns permitted within [`JOB_DEFAULT_RESPAWN_INTERVAL`].
pub const JOB_DEFAULT_RESPAWN_LIMIT: u32 = 10;

/// Seconds before the respawn counter window resets.
pub const JOB_DEFAULT_RESPAWN_INTERVAL: u64 = 5;

/// Default file creation mask for job processes.
pub const JOB_DEFAULT_UMASK: u32 = 0o022;

/// Environment variables always copied from the daemon's own environment;
/// job definitions and events may override them.
pub const JOB_DEFAULT_ENVIRONMENT: [&str; 2] = ["PATH", "TERM"];

// ============================================================================
// Event Names and Keys
// ============================================================================

/// Event emitted once at boot (overridable with `--startup-event`).
pub const STARTUP_EVENT: &str = "startup";

/// Event emitted when an instance begins starting.
pub const STARTING_EVENT: &str = "starting";

/// Event emitted when an instance reaches the running state.
pub const STARTED_EVENT: &str = "started";

/// Event emitted when an instance begins stopping.
pub const STOPPING_EVENT: &str = "stopping";

/// Event emitted when an instance has finished stopping.
pub const STOPPED_EVENT: &str = "stopped";

/// Event emitted by the SysV-compat shim.
pub const RUNLEVEL_EVENT: &str = "runlevel";

/// Event synthesised from `SIGINT` (kernel three-finger-salute relay).
pub const CTRLALTDEL_EVENT: &str = "ctrl-alt-del";

/// Event synthesised from `SIGWINCH` when delivered by the keyboard driver.
pub const KBDREQUEST_EVENT: &str = "kbdrequest";

/// Event synthesised from `SIGPWR`.
pub const PWRSTATUS_EVENT: &str = "power-status-changed";

/// Event emitted when `PR_SET_CHILD_SUBREAPER` registration fails.
pub const SUBREAPER_FAILED_EVENT: &str = "child-subreaper-failed";

/// Environment key naming the job class in job events.
pub const JOB_ENV_KEY: &str = "JOB";

/// Environment key naming the instance in job events.
pub const INSTANCE_ENV_KEY: &str = "INSTANCE";

/// Environment key carrying the space-separated list of events that caused
/// a start or stop.
pub const EVENTS_ENV_KEY: &str = "EVENTS";

// ============================================================================
// Re-exec Handover
// ============================================================================

/// Seconds a freshly exec'd daemon waits for the serialised state document
/// on `--state-fd` before falling back to a stateless boot.
pub const STATE_WAIT_SECS: u64 = 3;

/// Requested capacity for the state pipe; state larger than the pipe buffer
/// would wedge the handover.
pub const STATE_PIPE_CAPACITY: i32 = 1024 * 1024;

// ============================================================================
// Main Loop
// ============================================================================

/// Upper bound on one multiplexed wait when no timer is armed.
pub const LOOP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between retries of a `fork` that failed with `EAGAIN`.
pub const FORK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Buffer size for draining pty masters and pipes into job logs.
pub const LOG_READ_BUFFER: usize = 8192;
