//! Job classes: immutable templates describing how to run a service or
//! task, and the name-keyed registry they are installed into.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum_macros::{Display, EnumString};
use tracing::debug;

use crate::environ;
use crate::operator::EventExpression;
use crate::paths;
use crate::process::{ProcessRole, ProcessSpec};

/// What to expect before a job leaves the spawned state.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExpectType {
    /// Nothing: advance immediately.
    #[default]
    None,
    /// The main process raises `SIGSTOP` when ready.
    Stop,
    /// The main process daemonises with a double fork.
    Daemon,
    /// The main process forks once.
    Fork,
}

/// How a job's standard descriptors are arranged.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConsoleType {
    /// Everything mapped to `/dev/null`.
    None,
    /// The console device, without becoming its owner.
    Output,
    /// The console device, taking controlling-terminal ownership.
    Owner,
    /// stdout/stderr captured by the built-in logger via a pty.
    #[default]
    Log,
}

/// Value for one side of a resource limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LimitValue {
    /// A fixed numeric limit.
    Fixed(u64),
    /// `RLIM_INFINITY`.
    Unlimited,
}

impl LimitValue {
    /// Converts to the raw `rlim_t` value.
    pub fn to_rlim(self) -> libc::rlim_t {
        match self {
            LimitValue::Fixed(v) => v as libc::rlim_t,
            LimitValue::Unlimited => libc::RLIM_INFINITY,
        }
    }
}

/// Soft and hard halves of one rlimit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlimitSpec {
    /// Soft limit.
    pub soft: LimitValue,
    /// Hard limit.
    pub hard: LimitValue,
}

/// Resources a `limit` stanza can set, named as they appear in job files.
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
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum RlimitResource {
    /// `RLIMIT_AS`.
    As,
    /// `RLIMIT_CORE`.
    Core,
    /// `RLIMIT_CPU`.
    Cpu,
    /// `RLIMIT_DATA`.
    Data,
    /// `RLIMIT_FSIZE`.
    Fsize,
    /// `RLIMIT_MEMLOCK`.
    Memlock,
    /// `RLIMIT_MSGQUEUE`.
    Msgqueue,
    /// `RLIMIT_NICE`.
    Nice,
    /// `RLIMIT_NOFILE`.
    Nofile,
    /// `RLIMIT_NPROC`.
    Nproc,
    /// `RLIMIT_RSS`.
    Rss,
    /// `RLIMIT_RTPRIO`.
    Rtprio,
    /// `RLIMIT_SIGPENDING`.
    Sigpending,
    /// `RLIMIT_STACK`.
    Stack,
}

impl RlimitResource {
    /// The `nix` resource this limit applies to.
    pub fn to_resource(self) -> nix::sys::resource::Resource {
        use nix::sys::resource::Resource;
        match self {
            RlimitResource::As => Resource::RLIMIT_AS,
            RlimitResource::Core => Resource::RLIMIT_CORE,
            RlimitResource::Cpu => Resource::RLIMIT_CPU,
            RlimitResource::Data => Resource::RLIMIT_DATA,
            RlimitResource::Fsize => Resource::RLIMIT_FSIZE,
            RlimitResource::Memlock => Resource::RLIMIT_MEMLOCK,
            RlimitResource::Msgqueue => Resource::RLIMIT_MSGQUEUE,
            RlimitResource::Nice => Resource::RLIMIT_NICE,
            RlimitResource::Nofile => Resource::RLIMIT_NOFILE,
            RlimitResource::Nproc => Resource::RLIMIT_NPROC,
            RlimitResource::Rss => Resource::RLIMIT_RSS,
            RlimitResource::Rtprio => Resource::RLIMIT_RTPRIO,
            RlimitResource::Sigpending => Resource::RLIMIT_SIGPENDING,
            RlimitResource::Stack => Resource::RLIMIT_STACK,
        }
    }
}

/// Security profile policy for the main process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApparmorPolicy {
    /// Load the profile at the given path before switching to it.
    Load(String),
    /// Switch to an already-loaded profile; `$NAME` references are
    /// expanded against the job environment at spawn time.
    Switch(String),
}

/// One cgroup the job's processes join before exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupSpec {
    /// Controller name (e.g. `memory`).
    pub controller: String,
    /// Cgroup name under the controller; defaults to the job name.
    pub name: Option<String>,
    /// KEY VALUE settings written into the cgroup directory.
    #[serde(default)]
    pub settings: Vec<(String, String)>,
}

/// The immutable description of a service or task.
///
/// Tasks and services are fundamentally identical except for when they
/// "finish"; both are collated here and differ only in `task`.
#[derive(Debug, PartialEq)]
pub struct JobClass {
    /// Unique name within the registry.
    pub name: String,
    /// Optional session binding (chroot namespace) the class belongs to.
    pub session: Option<String>,
    /// Template for instance names, expanded per start request.
    pub instance: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// Author, for humans.
    pub author: Option<String>,
    /// Version, for humans.
    pub version: Option<String>,
    /// Usage text shown when starting the job by hand fails.
    pub usage: Option<String>,
    /// Default KEY=VALUE environment for instances.
    pub env: Vec<String>,
    /// Names of environment variables exported into job events.
    pub export: Vec<String>,
    /// Condition that starts an instance.
    pub start_on: Option<EventExpression>,
    /// Condition that stops running instances.
    pub stop_on: Option<EventExpression>,
    /// Events instances of this class may emit, for introspection.
    pub emits: Vec<String>,
    /// Process definitions, by role.
    pub processes: BTreeMap<ProcessRole, ProcessSpec>,
    /// How to detect that the main process finished starting.
    pub expect: ExpectType,
    /// Whether start requesters wait for the instance to finish rather
    /// than merely run.
    pub task: bool,
    /// Seconds between the kill signal and `SIGKILL`.
    pub kill_timeout: u64,
    /// First signal sent when stopping a process.
    pub kill_signal: i32,
    /// Signal sent by the reload operation.
    pub reload_signal: i32,
    /// Whether a failed main process is respawned.
    pub respawn: bool,
    /// Respawns permitted within `respawn_interval`.
    pub respawn_limit: u32,
    /// Seconds before the respawn window resets.
    pub respawn_interval: u64,
    /// Exit statuses that do not count as failure; signals are encoded in
    /// the upper byte.
    pub normalexit: Vec<i32>,
    /// Console arrangement for spawned processes.
    pub console: ConsoleType,
    /// File creation mask.
    pub umask: u32,
    /// Scheduling priority, when set.
    pub nice: Option<i32>,
    /// OOM killer score adjustment, when set.
    pub oom_score_adj: Option<i32>,
    /// Resource limits applied before exec.
    pub limits: BTreeMap<RlimitResource, RlimitSpec>,
    /// Root directory for spawned processes.
    pub chroot: Option<String>,
    /// Working directory for spawned processes.
    pub chdir: Option<String>,
    /// User name to drop to before exec.
    pub setuid: Option<String>,
    /// Group name to drop to before exec.
    pub setgid: Option<String>,
    /// Security profile policy.
    pub apparmor: Option<ApparmorPolicy>,
    /// Cgroups joined before exec.
    pub cgroups: Vec<CgroupSpec>,
    /// Raise spawn diagnostics for this class to debug level.
    pub debug: bool,
    /// Set when a reload removed the class while instances remain; the
    /// class is dropped when its last instance is reaped.
    pub deleted: Cell<bool>,
}

impl JobClass {
    /// Creates a class with the daemon defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session: None,
            instance: String::new(),
            description: None,
            author: None,
            version: None,
            usage: None,
            env: Vec::new(),
            export: Vec::new(),
            start_on: None,
            stop_on: None,
            emits: Vec::new(),
            processes: BTreeMap::new(),
            expect: ExpectType::None,
            task: false,
            kill_timeout: paths::JOB_DEFAULT_KILL_TIMEOUT,
            kill_signal: libc::SIGTERM,
            reload_signal: libc::SIGHUP,
            respawn: false,
            respawn_limit: paths::JOB_DEFAULT_RESPAWN_LIMIT,
            respawn_interval: paths::JOB_DEFAULT_RESPAWN_INTERVAL,
            normalexit: Vec::new(),
            console: ConsoleType::default(),
            umask: paths::JOB_DEFAULT_UMASK,
            nice: None,
            oom_score_adj: None,
            limits: BTreeMap::new(),
            chroot: None,
            chdir: None,
            setuid: None,
            setgid: None,
            apparmor: None,
            cgroups: Vec::new(),
            debug: false,
            deleted: Cell::new(false),
        }
    }

    /// The process definition for a role, if any.
    pub fn process(&self, role: ProcessRole) -> Option<&ProcessSpec> {
        self.processes.get(&role)
    }

    /// Whether `status` (exit code, or signal in the upper byte) is listed
    /// as a normal exit.
    ///
    /// Zero is implicitly normal except for respawn services, whose main
    /// process is never expected to exit at all.
    pub fn exit_is_normal(&self, status: i32) -> bool {
        if status == 0 && !(self.respawn && !self.task) {
            return true;
        }
        self.normalexit.contains(&status)
    }

    /// Base environment for a new instance: the inherited defaults from
    /// the daemon's own environment, then the class `env` stanzas.
    pub fn environment(&self) -> Vec<String> {
        let mut env = Vec::new();
        for name in paths::JOB_DEFAULT_ENVIRONMENT {
            if let Ok(value) = std::env::var(name) {
                environ::set(&mut env, &format!("{name}={value}"));
            }
        }
        environ::append(&mut env, &self.env);
        env
    }

    /// Content hash over everything that affects runtime behaviour; used
    /// by reload to decide whether a class actually changed.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0]);
        hasher.update(self.instance.as_bytes());
        hasher.update([0]);
        for entry in self.env.iter().chain(self.export.iter()) {
            hasher.update(entry.as_bytes());
            hasher.update([0]);
        }
        for condition in [&self.start_on, &self.stop_on] {
            if let Some(expr) = condition {
                hasher.update(expr.collapse().as_bytes());
            }
            hasher.update([0]);
        }
        for (role, spec) in &self.processes {
            hasher.update(role.as_ref().as_bytes());
            hasher.update(spec.hash().as_bytes());
        }
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{:?}|{:?}|{:?}|{:?}|{:?}|{:?}|{:?}|{:?}",
            self.expect,
            self.task,
            self.kill_timeout,
            self.kill_signal,
            self.reload_signal,
            self.respawn,
            self.respawn_limit,
            self.respawn_interval,
            self.console,
            self.normalexit,
            self.umask,
            self.nice,
            self.oom_score_adj,
            self.limits,
            self.chroot,
            self.chdir,
            (&self.setuid, &self.setgid, &self.apparmor, &self.cgroups),
        ));
        format!("{:x}", hasher.finalize())
    }
}

/// The global name-keyed class map, with the replace-or-stash rule.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: BTreeMap<String, Rc<JobClass>>,
    stashed: HashMap<String, Rc<JobClass>>,
}

impl ClassRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an installed class.
    pub fn get(&self, name: &str) -> Option<&Rc<JobClass>> {
        self.classes.get(name)
    }

    /// Iterates installed classes in name order; the order is stable
    /// across main-loop ticks.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Rc<JobClass>)> {
        self.classes.iter()
    }

    /// Installed class names.
    pub fn names(&self) -> Vec<String> {
        self.classes.keys().cloned().collect()
    }

    /// Installs or updates a class.
    ///
    /// A mapped class still referenced by instances is not replaced;
    /// the incoming class is stashed and swapped in by
    /// [`reconsider`](Self::reconsider) once the last instance is reaped.
    /// Returns whether the class was installed immediately.
    pub fn install(&mut self, class: Rc<JobClass>, in_use: bool) -> bool {
        let name = class.name.clone();
        match self.classes.get(&name) {
            Some(existing) if in_use => {
                if existing.content_hash() == class.content_hash() {
                    // Unchanged definition; nothing to swap later.
                    self.stashed.remove(&name);
                    return false;
                }
                debug!(class = %name, "definition changed while in use; stashing");
                self.stashed.insert(name, class);
                false
            }
            _ => {
                self.stashed.remove(&name);
                self.classes.insert(name, class);
                true
            }
        }
    }

    /// Marks a class as removed by a reload.
    ///
    /// While instances remain the class is tombstoned and left installed;
    /// otherwise it is dropped immediately.
    pub fn remove(&mut self, name: &str, in_use: bool) {
        self.stashed.remove(name);
        if in_use {
            if let Some(class) = self.classes.get(name) {
                class.deleted.set(true);
            }
        } else {
            self.classes.remove(name);
        }
    }

    /// Re-evaluates one class after its last instance went away: swaps in
    /// a stashed replacement or drops a tombstone. Returns the newly
    /// installed class, if any.
    pub fn reconsider(&mut self, name: &str, in_use: bool) -> Option<Rc<JobClass>> {
        if in_use {
            return None;
        }
        if let Some(replacement) = self.stashed.remove(name) {
            debug!(class = %name, "swapping in stashed definition");
            self.classes
                .insert(name.to_string(), Rc::clone(&replacement));
            return Some(replacement);
        }
        if let Some(class) = self.classes.get(name) {
            if class.deleted.get() {
                self.classes.remove(name);
            }
        }
        None
    }

    /// Whether a replacement is stashed for `name`.
    pub fn has_stashed(&self, name: &str) -> bool {
        self.stashed.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr;

    fn class(name: &str) -> JobClass {
        let mut class = JobClass::new(name);
        class
            .processes
            .insert(ProcessRole::Main, ProcessSpec::new(false, "/bin/true"));
        class
    }

    #[test]
    fn defaults_match_the_documented_policy() {
        let class = JobClass::new("demo");
        assert_eq!(class.kill_timeout, 5);
        assert_eq!(class.kill_signal, libc::SIGTERM);
        assert_eq!(class.respawn_limit, 10);
        assert_eq!(class.respawn_interval, 5);
        assert_eq!(class.umask, 0o022);
        assert_eq!(class.console, ConsoleType::Log);
        assert_eq!(class.expect, ExpectType::None);
        assert!(!class.task);
    }

    #[test]
    fn zero_exit_is_failure_only_for_respawn_services() {
        let mut demo = class("demo");
        assert!(demo.exit_is_normal(0));
        assert!(!demo.exit_is_normal(1));

        demo.respawn = true;
        assert!(!demo.exit_is_normal(0));

        demo.normalexit.push(0);
        assert!(demo.exit_is_normal(0));

        demo.task = true;
        assert!(demo.exit_is_normal(0));
    }

    #[test]
    fn normal_exit_distinguishes_signals_from_codes() {
        let mut demo = class("demo");
        demo.normalexit.push(libc::SIGHUP << 8);
        assert!(demo.exit_is_normal(libc::SIGHUP << 8));
        assert!(!demo.exit_is_normal(libc::SIGHUP));
    }

    #[test]
    fn content_hash_tracks_condition_changes() {
        let mut a = class("demo");
        let mut b = class("demo");
        assert_eq!(a.content_hash(), b.content_hash());

        a.start_on = Some(expr::parse_str("startup", 1).unwrap());
        assert_ne!(a.content_hash(), b.content_hash());

        b.start_on = Some(expr::parse_str("startup", 1).unwrap());
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn install_replaces_only_unreferenced_classes() {
        let mut registry = ClassRegistry::new();
        assert!(registry.install(Rc::new(class("demo")), false));

        let mut changed = class("demo");
        changed.respawn = true;
        let changed = Rc::new(changed);
        assert!(!registry.install(Rc::clone(&changed), true));
        assert!(registry.has_stashed("demo"));
        assert!(!registry.get("demo").unwrap().respawn);

        let swapped = registry.reconsider("demo", false).expect("swap");
        assert!(swapped.respawn);
        assert!(registry.get("demo").unwrap().respawn);
        assert!(!registry.has_stashed("demo"));
    }

    #[test]
    fn unchanged_definition_is_not_stashed() {
        let mut registry = ClassRegistry::new();
        registry.install(Rc::new(class("demo")), false);
        assert!(!registry.install(Rc::new(class("demo")), true));
        assert!(!registry.has_stashed("demo"));
    }

    #[test]
    fn tombstoned_class_is_freed_with_its_last_instance() {
        let mut registry = ClassRegistry::new();
        registry.install(Rc::new(class("demo")), false);

        registry.remove("demo", true);
        assert!(registry.get("demo").is_some(), "still referenced");
        assert!(registry.get("demo").unwrap().deleted.get());

        registry.reconsider("demo", false);
        assert!(registry.get("demo").is_none());
    }

    #[test]
    fn rlimit_names_parse_from_config_vocabulary() {
        assert_eq!(
            "nofile".parse::<RlimitResource>().unwrap(),
            RlimitResource::Nofile
        );
        assert_eq!(
            "memlock".parse::<RlimitResource>().unwrap(),
            RlimitResource::Memlock
        );
        assert!("bogus".parse::<RlimitResource>().is_err());
    }

    #[test]
    fn limit_values_convert_to_rlim() {
        assert_eq!(LimitValue::Fixed(4096).to_rlim(), 4096);
        assert_eq!(LimitValue::Unlimited.to_rlim(), libc::RLIM_INFINITY);
    }
}
