//! Stateful re-exec.
//!
//! On `SIGTERM` the daemon marshals its entire world — sessions, retained
//! events with their waiter lists, classes with their instances and
//! in-flight spawns, and operator trees as post-order arrays — into one
//! JSON document, hands it to its successor image over a pipe named by
//! `--state-fd`, and execs itself. The successor rebuilds the graph and
//! recomputes every event's blocker count by replaying the references.
//!
//! Descriptors referenced by the document (event fds, error pipes, script
//! feeders, pty masters) survive the exec by having close-on-exec cleared
//! first; the successor restores the flag after deserialising.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StateError;
use crate::event::{Blocked, Event, EventPool, EventProgress, JobKey};
use crate::job::{Goal, Job, JobState, ProcessData, TraceState};
use crate::job_class::{
    ApparmorPolicy, CgroupSpec, ClassRegistry, ConsoleType, ExpectType, JobClass,
    RlimitResource, RlimitSpec,
};
use crate::log::Log;
use crate::operator::{EventExpression, SerialOperator};
use crate::paths::{STATE_PIPE_CAPACITY, STATE_WAIT_SECS};
use crate::process::{ProcessRole, ProcessSpec};

/// One session binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Session name.
    pub name: String,
    /// Chroot applied to jobs bound to the session.
    pub chroot: Option<String>,
}

/// A waiter record with event references rewritten to document indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockedState {
    /// An event held back from poll-free.
    Event(usize),
    /// A job instance waiting to be poked.
    Job(JobKey),
}

/// One retained event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventState {
    /// Event name.
    pub name: String,
    /// KEY=VALUE bindings.
    pub env: Vec<String>,
    /// Externally-produced descriptor carried across the exec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd: Option<i32>,
    /// Queue position.
    pub progress: EventProgress,
    /// Waiters released when the event finishes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocking: Vec<BlockedState>,
}

/// One in-flight spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingState {
    /// Forked pid.
    pub pid: i32,
    /// Whether the spawn is still live.
    pub valid: bool,
    /// Error pipe descriptor.
    pub error_fd: i32,
    /// Script feeder descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_fd: Option<i32>,
    /// Script body awaiting the feeder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Exit status latched before setup completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
}

/// One attached job log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogState {
    /// Destination path.
    pub path: std::path::PathBuf,
    /// The pty master being drained, if still open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd: Option<i32>,
}

/// One live instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Expanded instance name.
    pub name: String,
    /// Current goal.
    pub goal: Goal,
    /// Current state.
    pub state: JobState,
    /// Base environment.
    pub env: Vec<String>,
    /// Stop-time environment additions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_env: Vec<String>,
    /// Live per-instance stop condition, post-order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_on: Option<Vec<SerialOperator>>,
    /// Live pids by role.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pids: BTreeMap<ProcessRole, i32>,
    /// Event index this instance waits on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker: Option<usize>,
    /// Waiters on this instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocking: Vec<BlockedState>,
    /// Seconds left on the kill timer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_timer_remaining: Option<u64>,
    /// Role the kill timer targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_process: Option<ProcessRole>,
    /// Failure flag.
    #[serde(default)]
    pub failed: bool,
    /// First failed role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_process: Option<ProcessRole>,
    /// Collected failure status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    /// Seconds since the respawn window opened.
    #[serde(default)]
    pub respawn_window_elapsed: u64,
    /// Respawns inside the window.
    #[serde(default)]
    pub respawn_count: u32,
    /// Ptrace progress.
    #[serde(default)]
    pub trace_state: TraceState,
    /// Forks observed while tracing.
    #[serde(default)]
    pub trace_forks: u32,
    /// In-flight spawns.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pending: BTreeMap<ProcessRole, PendingState>,
    /// Attached logs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub logs: BTreeMap<ProcessRole, LogState>,
    /// Terminal-state marker.
    #[serde(default)]
    pub finished: bool,
}

/// One installed class with its instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassState {
    /// Class name.
    pub name: String,
    /// Session binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Instance-name template.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance: String,
    /// Description, author, version, usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    /// Default environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Exported variable names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub export: Vec<String>,
    /// Live start condition, post-order (carries matched state).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_on: Option<Vec<SerialOperator>>,
    /// Stop-condition template, post-order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_on: Option<Vec<SerialOperator>>,
    /// Emitted event names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emits: Vec<String>,
    /// Process definitions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub processes: BTreeMap<ProcessRole, ProcessSpec>,
    pub expect: ExpectType,
    #[serde(default)]
    pub task: bool,
    pub kill_timeout: u64,
    pub kill_signal: i32,
    pub reload_signal: i32,
    #[serde(default)]
    pub respawn: bool,
    pub respawn_limit: u32,
    pub respawn_interval: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub normalexit: Vec<i32>,
    pub console: ConsoleType,
    pub umask: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nice: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oom_score_adj: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<RlimitResource, RlimitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chroot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setgid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apparmor: Option<ApparmorPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cgroups: Vec<CgroupSpec>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub deleted: bool,
    /// Live instances.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceState>,
}

/// The whole-daemon state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// Sessions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<SessionState>,
    /// Retained events, indexed by position.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventState>,
    /// Installed classes with their instances.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<ClassState>,
}

/// Everything rebuilt from a state document.
pub struct RestoredState {
    /// Sessions.
    pub sessions: HashMap<String, Option<String>>,
    /// The event arena with recomputed blocker counts.
    pub pool: EventPool,
    /// Installed classes.
    pub classes: Vec<Rc<JobClass>>,
    /// Live per-class start conditions.
    pub start_conditions: BTreeMap<String, EventExpression>,
    /// Live instances.
    pub jobs: BTreeMap<JobKey, Job>,
}

fn blocked_state(record: &Blocked, index_of: &HashMap<usize, usize>) -> Option<BlockedState> {
    match record {
        Blocked::Event(id) => index_of.get(id).map(|idx| BlockedState::Event(*idx)),
        Blocked::Job(key) => Some(BlockedState::Job(key.clone())),
        // Control clients cannot survive an exec; the runtime answers
        // them before the document is built.
        Blocked::Control { .. } => None,
    }
}

fn translate_operators(
    ops: Vec<SerialOperator>,
    index_of: &HashMap<usize, usize>,
) -> Result<Vec<SerialOperator>, StateError> {
    ops.into_iter()
        .map(|mut op| {
            if let Some(id) = op.event {
                let index = index_of
                    .get(&id)
                    .copied()
                    .ok_or(StateError::DanglingIndex { what: "event", index: id })?;
                op.event = Some(index);
            }
            Ok(op)
        })
        .collect()
}

fn cleared_operators(ops: &[SerialOperator]) -> Vec<SerialOperator> {
    ops.iter()
        .map(|op| SerialOperator {
            op: op.op,
            value: false,
            name: op.name.clone(),
            env: op.env.clone(),
            event: None,
        })
        .collect()
}

/// Builds the state document from the live world.
pub fn build(
    sessions: &HashMap<String, Option<String>>,
    pool: &EventPool,
    registry: &ClassRegistry,
    start_conditions: &BTreeMap<String, EventExpression>,
    jobs: &BTreeMap<JobKey, Job>,
) -> Result<StateDocument, StateError> {
    // Dense indices for the sparse event arena.
    let mut index_of = HashMap::new();
    for (position, (id, _)) in pool.iter().enumerate() {
        index_of.insert(id, position);
    }

    let events = pool
        .iter()
        .map(|(_, event)| EventState {
            name: event.name.clone(),
            env: event.env.clone(),
            fd: event.fd,
            progress: event.progress,
            blocking: event
                .blocking
                .iter()
                .filter_map(|record| blocked_state(record, &index_of))
                .collect(),
        })
        .collect();

    let mut classes = Vec::new();
    for (name, class) in registry.iter() {
        let start_on = match start_conditions.get(name) {
            Some(live) => Some(translate_operators(live.serialise(), &index_of)?),
            None => class.start_on.as_ref().map(|expr| expr.serialise()),
        };

        let mut instances = Vec::new();
        for job in jobs.values().filter(|job| &job.class.name == name) {
            let stop_on = match &job.stop_on {
                Some(live) => Some(translate_operators(live.serialise(), &index_of)?),
                None => None,
            };
            let blocker = match job.blocker {
                Some(id) => Some(index_of.get(&id).copied().ok_or(
                    StateError::DanglingIndex { what: "event", index: id },
                )?),
                None => None,
            };
            instances.push(InstanceState {
                name: job.name.clone(),
                goal: job.goal,
                state: job.state,
                env: job.env.clone(),
                stop_env: job.stop_env.clone(),
                stop_on,
                pids: job.pids.clone(),
                blocker,
                blocking: job
                    .blocking
                    .iter()
                    .filter_map(|record| blocked_state(record, &index_of))
                    .collect(),
                kill_timer_remaining: job.kill_timer.map(|deadline| {
                    deadline
                        .saturating_duration_since(Instant::now())
                        .as_secs()
                }),
                kill_process: job.kill_process,
                failed: job.failed,
                failed_process: job.failed_process,
                exit_status: job.exit_status,
                respawn_window_elapsed: job.respawn_time.elapsed().as_secs(),
                respawn_count: job.respawn_count,
                trace_state: job.trace_state,
                trace_forks: job.trace_forks,
                pending: job
                    .pending
                    .iter()
                    .filter(|(_, data)| data.valid)
                    .map(|(role, data)| {
                        (
                            *role,
                            PendingState {
                                pid: data.pid,
                                valid: data.valid,
                                error_fd: data.error_fd,
                                shell_fd: data.shell_fd,
                                script: data
                                    .script
                                    .as_ref()
                                    .map(|s| String::from_utf8_lossy(s).into_owned()),
                                status: data.status,
                            },
                        )
                    })
                    .collect(),
                logs: job
                    .logs
                    .iter()
                    .map(|(role, log)| {
                        (
                            *role,
                            LogState {
                                path: log.path.clone(),
                                fd: log.fd,
                            },
                        )
                    })
                    .collect(),
                finished: job.finished,
            });
        }

        classes.push(ClassState {
            name: class.name.clone(),
            session: class.session.clone(),
            instance: class.instance.clone(),
            description: class.description.clone(),
            author: class.author.clone(),
            version: class.version.clone(),
            usage: class.usage.clone(),
            env: class.env.clone(),
            export: class.export.clone(),
            start_on,
            stop_on: class.stop_on.as_ref().map(|expr| expr.serialise()),
            emits: class.emits.clone(),
            processes: class.processes.clone(),
            expect: class.expect,
            task: class.task,
            kill_timeout: class.kill_timeout,
            kill_signal: class.kill_signal,
            reload_signal: class.reload_signal,
            respawn: class.respawn,
            respawn_limit: class.respawn_limit,
            respawn_interval: class.respawn_interval,
            normalexit: class.normalexit.clone(),
            console: class.console,
            umask: class.umask,
            nice: class.nice,
            oom_score_adj: class.oom_score_adj,
            limits: class.limits.clone(),
            chroot: class.chroot.clone(),
            chdir: class.chdir.clone(),
            setuid: class.setuid.clone(),
            setgid: class.setgid.clone(),
            apparmor: class.apparmor.clone(),
            cgroups: class.cgroups.clone(),
            debug: class.debug,
            deleted: class.deleted.get(),
            instances,
        });
    }

    Ok(StateDocument {
        sessions: sessions
            .iter()
            .map(|(name, chroot)| SessionState {
                name: name.clone(),
                chroot: chroot.clone(),
            })
            .collect(),
        events,
        classes,
    })
}

fn restore_blocked(records: &[BlockedState], pool: &mut EventPool) -> Vec<Blocked> {
    records
        .iter()
        .map(|record| match record {
            BlockedState::Event(index) => {
                pool.block(*index);
                Blocked::Event(*index)
            }
            BlockedState::Job(key) => Blocked::Job(key.clone()),
        })
        .collect()
}

/// Rebuilds the world from a state document.
///
/// Event indices become arena slots directly (the pool is fresh, so the
/// slots are assigned densely in document order); blocker counts are
/// recomputed from operator references and waiter lists rather than
/// trusted from the predecessor.
pub fn restore(doc: StateDocument) -> Result<RestoredState, StateError> {
    let mut pool = EventPool::new();
    for event in &doc.events {
        pool.restore(Event {
            name: event.name.clone(),
            env: event.env.clone(),
            fd: event.fd,
            blockers: 0,
            progress: event.progress,
            blocking: Vec::new(),
        });
    }
    // Waiter lists, now that every slot exists.
    for (index, event) in doc.events.iter().enumerate() {
        let blocking = restore_blocked(&event.blocking, &mut pool);
        if let Some(live) = pool.get_mut(index) {
            live.blocking = blocking;
        }
    }

    let mut sessions = HashMap::new();
    for session in doc.sessions {
        sessions.insert(session.name, session.chroot);
    }

    let mut classes = Vec::new();
    let mut start_conditions = BTreeMap::new();
    let mut jobs = BTreeMap::new();

    for class_state in doc.classes {
        let mut class = JobClass::new(&class_state.name);
        class.session = class_state.session;
        class.instance = class_state.instance;
        class.description = class_state.description;
        class.author = class_state.author;
        class.version = class_state.version;
        class.usage = class_state.usage;
        class.env = class_state.env;
        class.export = class_state.export;
        class.emits = class_state.emits;
        class.processes = class_state.processes;
        class.expect = class_state.expect;
        class.task = class_state.task;
        class.kill_timeout = class_state.kill_timeout;
        class.kill_signal = class_state.kill_signal;
        class.reload_signal = class_state.reload_signal;
        class.respawn = class_state.respawn;
        class.respawn_limit = class_state.respawn_limit;
        class.respawn_interval = class_state.respawn_interval;
        class.normalexit = class_state.normalexit;
        class.console = class_state.console;
        class.umask = class_state.umask;
        class.nice = class_state.nice;
        class.oom_score_adj = class_state.oom_score_adj;
        class.limits = class_state.limits;
        class.chroot = class_state.chroot;
        class.chdir = class_state.chdir;
        class.setuid = class_state.setuid;
        class.setgid = class_state.setgid;
        class.apparmor = class_state.apparmor;
        class.cgroups = class_state.cgroups;
        class.debug = class_state.debug;
        class.deleted.set(class_state.deleted);

        if let Some(ops) = &class_state.start_on {
            // The class template holds the cleared shape; the live,
            // possibly part-matched condition goes to the runtime map.
            class.start_on = Some(EventExpression::deserialise(&cleared_operators(ops))?);
            let live = EventExpression::deserialise(ops)?;
            live.block_events(&mut pool);
            start_conditions.insert(class_state.name.clone(), live);
        }
        if let Some(ops) = &class_state.stop_on {
            class.stop_on = Some(EventExpression::deserialise(&cleared_operators(ops))?);
        }

        let class = Rc::new(class);

        for instance in class_state.instances {
            let stop_on = match &instance.stop_on {
                Some(ops) => {
                    let live = EventExpression::deserialise(ops)?;
                    live.block_events(&mut pool);
                    Some(live)
                }
                None => None,
            };

            let key = JobKey::new(class_state.name.clone(), instance.name.clone());
            let mut job = Job::new(
                Rc::clone(&class),
                instance.name,
                instance.env,
                &mut pool,
            );
            // Job::new copied the cleared class template; the live,
            // possibly part-matched instance condition replaces it.
            job.stop_on = stop_on;
            job.goal = instance.goal;
            job.state = instance.state;
            job.stop_env = instance.stop_env;
            job.pids = instance.pids;
            job.blocker = instance.blocker;
            if job.blocker.is_some_and(|id| pool.get(id).is_none()) {
                return Err(StateError::DanglingIndex {
                    what: "event",
                    index: job.blocker.unwrap_or_default(),
                });
            }
            job.blocking = restore_blocked(&instance.blocking, &mut pool);
            job.kill_timer = instance
                .kill_timer_remaining
                .map(|secs| Instant::now() + Duration::from_secs(secs));
            job.kill_process = instance.kill_process;
            job.failed = instance.failed;
            job.failed_process = instance.failed_process;
            job.exit_status = instance.exit_status;
            job.respawn_time = Instant::now()
                .checked_sub(Duration::from_secs(instance.respawn_window_elapsed))
                .unwrap_or_else(Instant::now);
            job.respawn_count = instance.respawn_count;
            job.trace_state = instance.trace_state;
            job.trace_forks = instance.trace_forks;
            job.finished = instance.finished;

            for (role, pending) in instance.pending {
                job.pending.insert(
                    role,
                    ProcessData {
                        pid: pending.pid,
                        valid: pending.valid,
                        error_fd: pending.error_fd,
                        shell_fd: pending.shell_fd,
                        script: pending.script.map(String::into_bytes),
                        status: pending.status,
                    },
                );
            }
            for (role, log_state) in instance.logs {
                if let Some(fd) = log_state.fd {
                    job.logs.insert(role, Log::new(log_state.path, fd));
                }
            }

            jobs.insert(key, job);
        }

        classes.push(class);
    }

    Ok(RestoredState {
        sessions,
        pool,
        classes,
        start_conditions,
        jobs,
    })
}

/// Every descriptor the document references; these must survive the exec.
pub fn referenced_fds(doc: &StateDocument) -> Vec<RawFd> {
    let mut fds = Vec::new();
    for event in &doc.events {
        if let Some(fd) = event.fd {
            fds.push(fd);
        }
    }
    for class in &doc.classes {
        for instance in &class.instances {
            for pending in instance.pending.values() {
                fds.push(pending.error_fd);
                if let Some(fd) = pending.shell_fd {
                    fds.push(fd);
                }
            }
            for log in instance.logs.values() {
                if let Some(fd) = log.fd {
                    fds.push(fd);
                }
            }
        }
    }
    fds
}

/// Clears or sets close-on-exec on a descriptor.
pub fn set_cloexec(fd: RawFd, enabled: bool) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return;
        }
        let flags = if enabled {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        libc::fcntl(fd, libc::F_SETFD, flags);
    }
}

/// Writes the document into the state pipe.
///
/// The pipe is widened first; a document larger than the pipe buffer
/// would wedge the handover, since nothing reads until after the exec.
pub fn write_state(fd: RawFd, doc: &StateDocument) -> Result<(), StateError> {
    let payload = serde_json::to_vec(doc)?;
    unsafe {
        if libc::fcntl(fd, libc::F_SETPIPE_SZ, STATE_PIPE_CAPACITY) < 0 {
            warn!("could not widen state pipe; large state may not fit");
        }
    }
    if payload.len() >= STATE_PIPE_CAPACITY as usize {
        warn!(
            size = payload.len(),
            "state document exceeds the pipe capacity"
        );
    }
    let mut file = unsafe {
        use std::os::unix::io::FromRawFd;
        std::fs::File::from_raw_fd(fd)
    };
    file.write_all(&payload)?;
    Ok(())
}

/// Reads the document from the inherited state descriptor, waiting at
/// most [`STATE_WAIT_SECS`] for it to become readable.
pub fn read_state(fd: RawFd) -> Result<StateDocument, StateError> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ready = unsafe {
        libc::poll(&mut pollfd, 1, (STATE_WAIT_SECS * 1000) as libc::c_int)
    };
    if ready <= 0 {
        return Err(StateError::Timeout);
    }

    let mut file = unsafe {
        use std::os::unix::io::FromRawFd;
        std::fs::File::from_raw_fd(fd)
    };
    let mut payload = Vec::new();
    file.read_to_end(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}
