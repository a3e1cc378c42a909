//! Error handling for emberd.
use nix::errno::Errno;
use thiserror::Error;

/// Defines all possible errors that can occur in the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read configuration: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing a job definition or event expression.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Error while setting up a job process before exec.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Error on the control socket.
    #[error(transparent)]
    Control(#[from] ControlError),

    /// Error serialising or restoring daemon state across exec.
    #[error(transparent)]
    State(#[from] StateError),

    /// Raw OS error from a syscall wrapper.
    #[error("System call failed: {0}")]
    Errno(#[from] Errno),
}

/// Errors raised while parsing job definitions and event expressions.
///
/// Every variant carries the line and token position the parser had
/// reached; the offending file is rejected wholesale and any previously
/// installed version of the class is preserved.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ParseError {
    /// A token that fits no production at this point.
    #[error("line {lineno}: unexpected token '{token}' at position {pos}")]
    UnexpectedToken {
        /// Line the token appeared on.
        lineno: usize,
        /// Token index within the line.
        pos: usize,
        /// The offending token text.
        token: String,
    },

    /// An opening parenthesis without a matching close, or vice versa.
    #[error("line {lineno}: mismatched parentheses at position {pos}")]
    MismatchedParens {
        /// Line of the unbalanced parenthesis.
        lineno: usize,
        /// Token index within the line.
        pos: usize,
    },

    /// An operator keyword where an event name was required.
    #[error("line {lineno}: expected event before position {pos}")]
    ExpectedEvent {
        /// Line of the failure.
        lineno: usize,
        /// Token index within the line.
        pos: usize,
    },

    /// An event name where `and`/`or` was required.
    #[error("line {lineno}: expected operator at position {pos}")]
    ExpectedOperator {
        /// Line of the failure.
        lineno: usize,
        /// Token index within the line.
        pos: usize,
    },

    /// A `$` reference with no variable name after it.
    #[error("line {lineno}: expected variable name at position {pos}")]
    ExpectedVariable {
        /// Line of the failure.
        lineno: usize,
        /// Token index within the line.
        pos: usize,
    },

    /// A positional match argument following a `KEY=`-style argument.
    #[error("line {lineno}: positional argument after named argument at position {pos}")]
    PositionalAfterNamed {
        /// Line of the failure.
        lineno: usize,
        /// Token index within the line.
        pos: usize,
    },

    /// A stanza keyword the grammar does not know.
    #[error("line {lineno}: unknown stanza '{stanza}'")]
    UnknownStanza {
        /// Line of the stanza.
        lineno: usize,
        /// The unrecognised keyword.
        stanza: String,
    },

    /// A stanza argument outside its legal range or form.
    #[error("line {lineno}: illegal {what} '{value}'")]
    IllegalValue {
        /// Line of the stanza.
        lineno: usize,
        /// What kind of value was expected (interval, limit, umask, ...).
        what: &'static str,
        /// The offending text.
        value: String,
    },

    /// A stanza that requires arguments was given none.
    #[error("line {lineno}: expected argument to '{stanza}'")]
    ExpectedArgument {
        /// Line of the stanza.
        lineno: usize,
        /// The stanza missing its argument.
        stanza: &'static str,
    },

    /// A `script` block with no `end script` before end of file.
    #[error("line {lineno}: unterminated script block")]
    UnterminatedScript {
        /// Line the block opened on.
        lineno: usize,
    },
}

/// The pre-exec setup step that failed inside a spawned child.
///
/// This is a closed enumeration: the child reports exactly one of these
/// over the error pipe, together with the errno it observed, and exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SpawnErrorKind {
    /// Restoring default signal handlers or unblocking signals.
    Signal,
    /// A transient allocation failed; the child aborts rather than
    /// continue with partial setup.
    Alloc,
    /// Duplicating a descriptor onto stdin/stdout/stderr.
    Dup,
    /// Opening or wiring the console device.
    Console,
    /// `grantpt` on the log pty.
    Grantpt,
    /// `unlockpt` on the log pty.
    Unlockpt,
    /// `ptsname_r` on the log pty.
    Ptsname,
    /// Opening the pty slave.
    OpenptSlave,
    /// Applying a resource limit; the argument is the resource index.
    Rlimit,
    /// `setpriority`.
    Priority,
    /// Writing the OOM score adjustment.
    OomAdj,
    /// `chroot`.
    Chroot,
    /// `chdir`.
    Chdir,
    /// Writing the security profile to `/proc/self/attr/exec`.
    Security,
    /// Looking up the `setuid` user name.
    Getpwnam,
    /// Looking up the `setgid` group name.
    Getgrnam,
    /// The `setuid` user does not exist.
    BadSetuid,
    /// The `setgid` group does not exist.
    BadSetgid,
    /// `initgroups`.
    Initgroups,
    /// Reaching the cgroup hierarchy.
    CgroupMgrConnect,
    /// Creating or configuring the cgroup.
    CgroupSetup,
    /// Joining the cgroup.
    CgroupEnter,
    /// `setgid`.
    Setgid,
    /// `setuid`.
    Setuid,
    /// `PTRACE_TRACEME`.
    Ptrace,
    /// The final `execvp`.
    Exec,
}

impl SpawnErrorKind {
    /// Decodes the wire discriminant written by the child.
    pub fn from_wire(raw: u32) -> Option<Self> {
        use SpawnErrorKind::*;
        const KINDS: [SpawnErrorKind; 26] = [
            Signal,
            Alloc,
            Dup,
            Console,
            Grantpt,
            Unlockpt,
            Ptsname,
            OpenptSlave,
            Rlimit,
            Priority,
            OomAdj,
            Chroot,
            Chdir,
            Security,
            Getpwnam,
            Getgrnam,
            BadSetuid,
            BadSetgid,
            Initgroups,
            CgroupMgrConnect,
            CgroupSetup,
            CgroupEnter,
            Setgid,
            Setuid,
            Ptrace,
            Exec,
        ];
        KINDS.get(raw as usize).copied()
    }
}

/// A structured setup failure reported by a spawned child over its error
/// pipe before `exec`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{}", self.message())]
pub struct SpawnError {
    /// Which setup step failed.
    pub kind: SpawnErrorKind,
    /// Step-specific argument (e.g. the rlimit resource index).
    pub arg: u32,
    /// The errno observed by the child.
    pub errno: Errno,
}

impl SpawnError {
    /// Human-readable description in the `unable to <step>: <strerror>`
    /// form logged when a spawn fails.
    pub fn message(&self) -> String {
        let what = match self.kind {
            SpawnErrorKind::Signal => "unable to reset signal handlers",
            SpawnErrorKind::Alloc => "unable to allocate memory",
            SpawnErrorKind::Dup => "unable to move file descriptor",
            SpawnErrorKind::Console => "unable to open console",
            SpawnErrorKind::Grantpt => "unable to grant pty slave",
            SpawnErrorKind::Unlockpt => "unable to unlock pty slave",
            SpawnErrorKind::Ptsname => "unable to name pty slave",
            SpawnErrorKind::OpenptSlave => "unable to open pty slave",
            SpawnErrorKind::Rlimit => {
                return format!(
                    "unable to set resource limit {}: {}",
                    self.arg,
                    self.errno.desc()
                );
            }
            SpawnErrorKind::Priority => "unable to set priority",
            SpawnErrorKind::OomAdj => "unable to set oom adjustment",
            SpawnErrorKind::Chroot => "unable to chroot",
            SpawnErrorKind::Chdir => "unable to change working directory",
            SpawnErrorKind::Security => "unable to switch security profile",
            SpawnErrorKind::Getpwnam => "unable to look up user",
            SpawnErrorKind::Getgrnam => "unable to look up group",
            SpawnErrorKind::BadSetuid => return "no such user".to_string(),
            SpawnErrorKind::BadSetgid => return "no such group".to_string(),
            SpawnErrorKind::Initgroups => "unable to set supplementary groups",
            SpawnErrorKind::CgroupMgrConnect => "unable to reach cgroup hierarchy",
            SpawnErrorKind::CgroupSetup => "unable to configure cgroup",
            SpawnErrorKind::CgroupEnter => "unable to join cgroup",
            SpawnErrorKind::Setgid => "unable to set group",
            SpawnErrorKind::Setuid => "unable to set user",
            SpawnErrorKind::Ptrace => "unable to trace process",
            SpawnErrorKind::Exec => "unable to execute",
        };
        format!("{}: {}", what, self.errno.desc())
    }
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Control socket I/O error.
    #[error("control socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Error serialising or deserialising control messages.
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),

    /// Control socket not available or daemon not running.
    #[error("control socket not available")]
    NotAvailable,

    /// Daemon reported an error.
    #[error("daemon reported error: {0}")]
    Server(String),
}

/// Errors raised while marshalling daemon state across a re-exec.
#[derive(Debug, Error)]
pub enum StateError {
    /// Reading or writing the state pipe failed.
    #[error("state pipe I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The state document could not be encoded or decoded.
    #[error("invalid state document: {0}")]
    Serde(#[from] serde_json::Error),

    /// The successor did not receive state within the grace period.
    #[error("timed out waiting for state descriptor")]
    Timeout,

    /// A serialised cross-reference points outside the document.
    #[error("dangling {what} index {index}")]
    DanglingIndex {
        /// Which table the index was for.
        what: &'static str,
        /// The out-of-range index.
        index: usize,
    },

    /// A serialised operator array could not be rebuilt into a tree.
    #[error("malformed operator array: {0}")]
    MalformedOperators(&'static str),
}
