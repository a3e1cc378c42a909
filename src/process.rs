//! Process definitions attached to job classes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::paths::{SHELL, SHELL_CHARS};

/// Which slot of a job class a process definition (or live pid) occupies.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ProcessRole {
    /// The long-running (or task) body of the job.
    Main,
    /// Runs before the main process is spawned.
    PreStart,
    /// Runs alongside the main process after it is spawned.
    PostStart,
    /// Runs before the main process is killed.
    PreStop,
    /// Runs after every other process has gone.
    PostStop,
    /// Applies the security profile before anything else runs.
    Security,
}

impl ProcessRole {
    /// Every role, in spawn-pipeline order.
    pub const ALL: [ProcessRole; 6] = [
        ProcessRole::Security,
        ProcessRole::PreStart,
        ProcessRole::Main,
        ProcessRole::PostStart,
        ProcessRole::PreStop,
        ProcessRole::PostStop,
    ];
}

/// How a spawned command line should be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpretation {
    /// No shell characters: split on whitespace and exec directly.
    Direct(Vec<String>),
    /// Single line needing a shell; passed via `sh -e -c`.
    ShellLine(String),
    /// Multi-line script; fed to the shell through a reserved descriptor.
    ShellScript(String),
}

/// A process definition: either a command line or a shell script body.
///
/// When `script` is false the command is checked for shell characters; if
/// there are none it is split on whitespace and executed directly,
/// otherwise it runs under a POSIX shell with `-e`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Whether a shell is always required.
    pub script: bool,
    /// Command or script body.
    pub command: String,
}

impl ProcessSpec {
    /// Creates a definition, trimming trailing newlines from the body.
    pub fn new(script: bool, command: impl Into<String>) -> Self {
        let mut command = command.into();
        while command.ends_with('\n') {
            command.pop();
        }
        Self { script, command }
    }

    /// Content hash over the `(script, command)` pair.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update([self.script as u8]);
        hasher.update(self.command.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Whether the command contains characters that force a shell.
    pub fn has_shell_chars(&self) -> bool {
        self.command.chars().any(|c| SHELL_CHARS.contains(c))
    }

    /// Decides how this definition will be executed.
    ///
    /// A direct command that turned out to need a shell is prefixed with
    /// `exec` so the shell process is replaced; declared scripts are
    /// passed verbatim. A script body that is a single line after newline
    /// trimming goes through `-c`, anything longer is drip-fed.
    pub fn interpretation(&self) -> Interpretation {
        if !self.script && !self.has_shell_chars() {
            return Interpretation::Direct(
                self.command
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            );
        }

        let body = if self.script {
            self.command.clone()
        } else {
            format!("exec {}", self.command)
        };

        if body.contains('\n') {
            Interpretation::ShellScript(body)
        } else {
            Interpretation::ShellLine(body)
        }
    }

    /// The argv this definition execs, given the `/proc/self/fd` path used
    /// for drip-fed scripts.
    pub fn argv(&self, script_fd: Option<i32>) -> Vec<String> {
        match self.interpretation() {
            Interpretation::Direct(argv) => argv,
            Interpretation::ShellLine(body) => vec![
                SHELL.to_string(),
                "-e".to_string(),
                "-c".to_string(),
                body,
            ],
            Interpretation::ShellScript(_) => {
                let fd = script_fd.expect("script spawn reserves a descriptor");
                vec![
                    SHELL.to_string(),
                    "-e".to_string(),
                    format!("/proc/self/fd/{fd}"),
                ]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_commands_exec_directly() {
        let spec = ProcessSpec::new(false, "/bin/echo hello world");
        assert_eq!(
            spec.interpretation(),
            Interpretation::Direct(vec![
                "/bin/echo".to_string(),
                "hello".to_string(),
                "world".to_string()
            ])
        );
    }

    #[test]
    fn shell_characters_force_a_shell_with_exec_prefix() {
        let spec = ProcessSpec::new(false, "echo $HOME > /tmp/out");
        match spec.interpretation() {
            Interpretation::ShellLine(body) => {
                assert_eq!(body, "exec echo $HOME > /tmp/out");
            }
            other => panic!("expected shell line, got {other:?}"),
        }
        assert_eq!(spec.argv(None)[..3], ["/bin/sh", "-e", "-c"]);
    }

    #[test]
    fn declared_scripts_are_passed_verbatim() {
        let spec = ProcessSpec::new(true, "echo one\n");
        match spec.interpretation() {
            Interpretation::ShellLine(body) => assert_eq!(body, "echo one"),
            other => panic!("expected shell line, got {other:?}"),
        }
    }

    #[test]
    fn multi_line_scripts_are_drip_fed() {
        let spec = ProcessSpec::new(true, "echo one\necho two\n\n");
        assert_eq!(spec.command, "echo one\necho two");
        match spec.interpretation() {
            Interpretation::ShellScript(body) => {
                assert_eq!(body, "echo one\necho two");
            }
            other => panic!("expected script, got {other:?}"),
        }
        assert_eq!(
            spec.argv(Some(9)),
            vec!["/bin/sh", "-e", "/proc/self/fd/9"]
        );
    }

    #[test]
    fn hash_is_content_addressed() {
        let a = ProcessSpec::new(false, "/bin/true\n");
        let b = ProcessSpec::new(false, "/bin/true");
        let c = ProcessSpec::new(true, "/bin/true");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn role_names_match_the_status_vocabulary() {
        assert_eq!(ProcessRole::PreStart.to_string(), "pre-start");
        assert_eq!(ProcessRole::Main.to_string(), "main");
        assert_eq!(
            "post-stop".parse::<ProcessRole>().unwrap(),
            ProcessRole::PostStop
        );
    }
}
