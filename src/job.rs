//! Job instances and their state machine.
//!
//! An instance is driven by two orthogonal inputs: its goal (the external
//! intent) and incoming process events. `next_state` is a pure table over
//! `(goal, state)`; entry actions either complete synchronously (the
//! change loop continues) or leave the instance resting until a blocker
//! release, a spawn completion, or a process death advances it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::{self, Pid};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{debug, info, warn};

use crate::environ;
use crate::error::SpawnError;
use crate::event::{Blocked, EventId, EventPool, JobKey};
use crate::job_class::{ExpectType, JobClass};
use crate::log::{self, Log};
use crate::operator::EventExpression;
use crate::paths::{
    INSTANCE_ENV_KEY, JOB_ENV_KEY, STARTED_EVENT, STARTING_EVENT, STOPPED_EVENT,
    STOPPING_EVENT,
};
use crate::process::ProcessRole;
use crate::spawn::{self, SpawnRequest};

/// External intent for an instance.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    /// Bring the instance up and keep it up.
    Start,
    /// Bring the instance down.
    Stop,
    /// Bring it down and immediately back up.
    Respawn,
}

/// Position in the spawn/run/kill pipeline.
///
/// Each scripted role has a distinct "spawning" state so the asynchronous
/// setup phase is observable from outside.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Idle; the terminal state.
    Waiting,
    /// Emitting and waiting on the `starting` event.
    Starting,
    /// Security process setup in flight.
    SecuritySpawning,
    /// Security process running.
    Security,
    /// Pre-start setup in flight.
    PreStarting,
    /// Pre-start process running.
    PreStart,
    /// Main process setup in flight.
    Spawning,
    /// Main process spawned; awaiting the class expectation.
    Spawned,
    /// Post-start setup in flight.
    PostStarting,
    /// Post-start process running.
    PostStart,
    /// Up; the `started` event has been emitted.
    Running,
    /// Pre-stop setup in flight.
    PreStopping,
    /// Pre-stop process running.
    PreStop,
    /// Emitting and waiting on the `stopping` event.
    Stopping,
    /// Kill signal sent; waiting for the main process to die.
    Killed,
    /// Post-stop setup in flight.
    PostStopping,
    /// Post-stop process running.
    PostStop,
}

/// Where the ptrace dance for the main process currently stands.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TraceState {
    /// Not tracing.
    #[default]
    None,
    /// Waiting for the freshly exec'd child's initial trap.
    New,
    /// Waiting for an adopted fork child's initial stop.
    NewChild,
    /// Options set; following forks and execs.
    Normal,
}

/// The pure state-transition table.
pub fn next_state(goal: Goal, state: JobState) -> JobState {
    use JobState::*;
    match (goal, state) {
        (Goal::Stop, Waiting) => Waiting,
        (_, Waiting) => Starting,

        (Goal::Start | Goal::Respawn, Starting) => SecuritySpawning,
        (Goal::Stop, Starting) => Stopping,

        (Goal::Start, SecuritySpawning) => Security,
        (_, SecuritySpawning) => Stopping,

        (Goal::Start, Security) => PreStarting,
        (_, Security) => Stopping,

        (Goal::Start, PreStarting) => PreStart,
        (_, PreStarting) => Stopping,

        (Goal::Start, PreStart) => Spawning,
        (_, PreStart) => Stopping,

        (Goal::Start, Spawning) => Spawned,
        (_, Spawning) => Stopping,

        (Goal::Start, Spawned) => PostStarting,
        (_, Spawned) => Stopping,

        (Goal::Start, PostStarting) => PostStart,
        (_, PostStarting) => Stopping,

        (Goal::Start, PostStart) => Running,
        (_, PostStart) => Stopping,

        (Goal::Stop, Running) => PreStopping,
        (_, Running) => Stopping,

        (Goal::Start, PreStopping) => Running,
        (_, PreStopping) => PreStop,

        (Goal::Start, PreStop) => Running,
        (_, PreStop) => Stopping,

        (_, Stopping) => Killed,
        (_, Killed) => PostStopping,
        (_, PostStopping) => PostStop,

        (Goal::Stop, PostStop) => Waiting,
        (_, PostStop) => Starting,
    }
}

/// The "spawning" state that watches a role's in-flight setup.
pub fn spawning_state(role: ProcessRole) -> JobState {
    match role {
        ProcessRole::Security => JobState::SecuritySpawning,
        ProcessRole::PreStart => JobState::PreStarting,
        ProcessRole::Main => JobState::Spawning,
        ProcessRole::PostStart => JobState::PostStarting,
        ProcessRole::PreStop => JobState::PreStopping,
        ProcessRole::PostStop => JobState::PostStopping,
    }
}

/// The state that waits on a role's running process.
fn waiting_state(role: ProcessRole) -> &'static [JobState] {
    match role {
        ProcessRole::Security => &[JobState::Security],
        ProcessRole::PreStart => &[JobState::PreStart],
        ProcessRole::Main => &[JobState::Spawned, JobState::Running, JobState::Killed],
        ProcessRole::PostStart => &[JobState::PostStart],
        ProcessRole::PreStop => &[JobState::PreStop],
        ProcessRole::PostStop => &[JobState::PostStop],
    }
}

/// Builds a wait status from an exit code.
pub fn status_from_exit(code: i32) -> i32 {
    code
}

/// Builds a wait status from a killing signal; the signal lives in the
/// upper byte so it can never be confused with an exit code.
pub fn status_from_signal(signal: i32) -> i32 {
    signal << 8
}

fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().trim_start_matches("SIG").to_string())
        .unwrap_or_else(|_| signal.to_string())
}

/// Captured state of one in-flight spawn.
#[derive(Debug)]
pub struct ProcessData {
    /// The forked pid.
    pub pid: i32,
    /// False once the spawn has been cancelled; reader wakeups become
    /// no-ops.
    pub valid: bool,
    /// Read side of the error pipe.
    pub error_fd: i32,
    /// Script feeder pipe, for drip-fed shell bodies.
    pub shell_fd: Option<i32>,
    /// Script bytes awaiting the feeder.
    pub script: Option<Vec<u8>>,
    /// Child exit latched before setup completed.
    pub status: Option<i32>,
}

impl ProcessData {
    /// Cancels the spawn: closes the pipes and invalidates the record.
    pub fn cancel(&mut self) {
        if !self.valid {
            return;
        }
        self.valid = false;
        unsafe { libc::close(self.error_fd) };
        if let Some(fd) = self.shell_fd.take() {
            unsafe { libc::close(fd) };
        }
    }
}

/// Everything an entry action needs besides the instance itself.
pub struct JobCtx<'a> {
    /// The event arena; emissions and blocker bookkeeping go through it.
    pub pool: &'a mut EventPool,
    /// Directory job logs live under.
    pub log_dir: PathBuf,
    /// Degrade `log` consoles to `none`.
    pub no_log: bool,
    /// Never respawn, regardless of class policy.
    pub disable_respawn: bool,
    /// Default the child working directory to `/`.
    pub system_mode: bool,
    /// Restore sane termios when handing out the console.
    pub reset_console: bool,
    /// Chroot of the class's session, if any.
    pub session_chroot: Option<String>,
    /// Non-event blocked records released during this call; the runtime
    /// answers control clients from here.
    pub released: Vec<Blocked>,
}

enum Entry {
    Rest,
    Continue,
}

/// A live realisation of a job class.
#[derive(Debug)]
pub struct Job {
    /// The class this instance was materialised from.
    pub class: Rc<JobClass>,
    /// Expanded instance name ("" for singletons).
    pub name: String,
    /// Desired end state.
    pub goal: Goal,
    /// Current pipeline position.
    pub state: JobState,
    /// Live pids by role.
    pub pids: BTreeMap<ProcessRole, i32>,
    /// Base environment fixed at start time.
    pub env: Vec<String>,
    /// Extra bindings captured when a stop was requested.
    pub stop_env: Vec<String>,
    /// Per-instance copy of the class `stop on` condition.
    pub stop_on: Option<EventExpression>,
    /// Event this instance is waiting on before advancing.
    pub blocker: Option<EventId>,
    /// Records waiting for this instance to finish transitioning.
    pub blocking: Vec<Blocked>,
    /// Armed kill-timer deadline, at most one per instance.
    pub kill_timer: Option<Instant>,
    /// Role the kill timer targets.
    pub kill_process: Option<ProcessRole>,
    /// Whether the instance failed.
    pub failed: bool,
    /// First role that failed.
    pub failed_process: Option<ProcessRole>,
    /// Status of the failed process, when one was collected.
    pub exit_status: Option<i32>,
    /// Start of the current respawn window.
    pub respawn_time: Instant,
    /// Respawns within the current window.
    pub respawn_count: u32,
    /// Ptrace progress for the main process.
    pub trace_state: TraceState,
    /// Forks observed while tracing.
    pub trace_forks: u32,
    /// In-flight spawns by role.
    pub pending: BTreeMap<ProcessRole, ProcessData>,
    /// Output logs by role.
    pub logs: BTreeMap<ProcessRole, Log>,
    /// Set when the terminal state was reached; the instance is destroyed
    /// one main-loop tick later.
    pub finished: bool,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.class.name)
        } else {
            write!(f, "{} ({})", self.class.name, self.name)
        }
    }
}

impl Job {
    /// Creates an idle instance of `class` with the given start
    /// environment.
    pub fn new(
        class: Rc<JobClass>,
        name: String,
        env: Vec<String>,
        pool: &mut EventPool,
    ) -> Self {
        let stop_on = class.stop_on.as_ref().map(|expr| expr.copy(pool));
        Self {
            class,
            name,
            goal: Goal::Stop,
            state: JobState::Waiting,
            pids: BTreeMap::new(),
            env,
            stop_env: Vec::new(),
            stop_on,
            blocker: None,
            blocking: Vec::new(),
            kill_timer: None,
            kill_process: None,
            failed: false,
            failed_process: None,
            exit_status: None,
            respawn_time: Instant::now(),
            respawn_count: 0,
            trace_state: TraceState::None,
            trace_forks: 0,
            pending: BTreeMap::new(),
            logs: BTreeMap::new(),
            finished: false,
        }
    }

    /// This instance's registry key.
    pub fn key(&self) -> JobKey {
        JobKey::new(self.class.name.clone(), self.name.clone())
    }

    /// Changes the goal and kicks the state machine when the current
    /// state is resting on the old intent.
    pub fn change_goal(&mut self, ctx: &mut JobCtx<'_>, goal: Goal) {
        if self.goal == goal {
            return;
        }
        debug!(job = %self, old = %self.goal, new = %goal, "goal changed");
        self.goal = goal;

        match goal {
            Goal::Start | Goal::Respawn => {
                if matches!(
                    self.state,
                    JobState::Waiting | JobState::PreStopping | JobState::PreStop
                ) {
                    self.goto_state(ctx, next_state(goal, self.state));
                }
            }
            Goal::Stop => {
                if self.state == JobState::Running {
                    self.goto_state(ctx, next_state(goal, self.state));
                }
            }
        }
    }

    /// Walks the state machine towards `target`, performing entry actions
    /// and continuing through states whose work completes synchronously.
    pub fn goto_state(&mut self, ctx: &mut JobCtx<'_>, mut target: JobState) {
        while self.state != target {
            info!(job = %self, goal = %self.goal, from = %self.state, to = %target,
                  "state change");
            self.state = target;
            match self.enter_state(ctx) {
                Entry::Rest => break,
                Entry::Continue => target = next_state(self.goal, self.state),
            }
        }
    }

    fn enter_state(&mut self, ctx: &mut JobCtx<'_>) -> Entry {
        match self.state {
            JobState::Waiting => {
                self.emit_job_event(ctx, STOPPED_EVENT, false, true);
                self.release_blocked(ctx);
                if let Some(stop_on) = &mut self.stop_on {
                    stop_on.reset(ctx.pool);
                }
                self.finished = true;
                Entry::Rest
            }
            JobState::Starting => {
                if self.goal == Goal::Respawn {
                    self.goal = Goal::Start;
                }
                self.finished = false;
                self.failed = false;
                self.failed_process = None;
                self.exit_status = None;
                self.emit_job_event(ctx, STARTING_EVENT, true, false);
                Entry::Rest
            }
            JobState::SecuritySpawning => self.spawn_role(ctx, ProcessRole::Security),
            JobState::Security => self.wait_for(ProcessRole::Security),
            JobState::PreStarting => self.spawn_role(ctx, ProcessRole::PreStart),
            JobState::PreStart => self.wait_for(ProcessRole::PreStart),
            JobState::Spawning => self.spawn_role(ctx, ProcessRole::Main),
            JobState::Spawned => {
                if self.pids.contains_key(&ProcessRole::Main) && !self.expectation_met()
                {
                    Entry::Rest
                } else {
                    Entry::Continue
                }
            }
            JobState::PostStarting => self.spawn_role(ctx, ProcessRole::PostStart),
            JobState::PostStart => self.wait_for(ProcessRole::PostStart),
            JobState::Running => {
                self.emit_job_event(ctx, STARTED_EVENT, false, false);
                if !self.class.task {
                    self.release_blocked(ctx);
                }
                Entry::Rest
            }
            JobState::PreStopping => {
                if self.pids.contains_key(&ProcessRole::Main) {
                    self.spawn_role(ctx, ProcessRole::PreStop)
                } else {
                    Entry::Continue
                }
            }
            JobState::PreStop => self.wait_for(ProcessRole::PreStop),
            JobState::Stopping => {
                self.emit_job_event(ctx, STOPPING_EVENT, true, true);
                Entry::Rest
            }
            JobState::Killed => {
                if let Some(&pid) = self.pids.get(&ProcessRole::Main) {
                    self.send_kill(ProcessRole::Main, pid);
                    Entry::Rest
                } else {
                    Entry::Continue
                }
            }
            JobState::PostStopping => self.spawn_role(ctx, ProcessRole::PostStop),
            JobState::PostStop => self.wait_for(ProcessRole::PostStop),
        }
    }

    fn wait_for(&self, role: ProcessRole) -> Entry {
        if self.pids.contains_key(&role) {
            Entry::Rest
        } else {
            Entry::Continue
        }
    }

    fn spawn_role(&mut self, ctx: &mut JobCtx<'_>, role: ProcessRole) -> Entry {
        if self.class.process(role).is_none() {
            return Entry::Continue;
        }

        let mut env = self.env.clone();
        if matches!(role, ProcessRole::PreStop | ProcessRole::PostStop) {
            environ::append(&mut env, &self.stop_env);
        }
        environ::set(&mut env, &format!("{JOB_ENV_KEY}={}", self.class.name));
        environ::set(&mut env, &format!("{INSTANCE_ENV_KEY}={}", self.name));

        let trace = role == ProcessRole::Main
            && matches!(self.class.expect, ExpectType::Fork | ExpectType::Daemon);

        if self.class.debug {
            debug!(
                job = %self, role = %role, trace,
                "spawning with {} environment entries",
                env.len()
            );
        }

        let request = SpawnRequest {
            class: &self.class,
            instance: &self.name,
            role,
            env: &env,
            trace,
            log_path: log::log_path(&ctx.log_dir, &self.class.name, &self.name),
            no_log: ctx.no_log,
            session_chroot: ctx.session_chroot.as_deref(),
            reset_console: ctx.reset_console,
            system_mode: ctx.system_mode,
        };

        match spawn::spawn(&request) {
            Ok(outcome) => {
                info!(job = %self, role = %role, pid = outcome.pid, "process spawned");
                self.pids.insert(role, outcome.pid);
                if let Some(log) = outcome.log {
                    self.logs.insert(role, log);
                }
                if trace {
                    self.trace_state = TraceState::New;
                    self.trace_forks = 0;
                }
                self.pending.insert(
                    role,
                    ProcessData {
                        pid: outcome.pid,
                        valid: true,
                        error_fd: outcome.error_fd,
                        shell_fd: outcome.shell_fd,
                        script: outcome.script,
                        status: None,
                    },
                );
                Entry::Rest
            }
            Err(err) => {
                self.note_spawn_failure(ctx, role, err);
                Entry::Continue
            }
        }
    }

    /// The error pipe closed without data: setup succeeded and the
    /// process exec'd. Feeds any pending script and advances out of the
    /// spawning state; a death latched during setup is processed now.
    pub fn spawn_succeeded(&mut self, ctx: &mut JobCtx<'_>, role: ProcessRole) {
        let Some(mut data) = self.pending.remove(&role) else {
            return;
        };
        if !data.valid {
            return;
        }
        unsafe { libc::close(data.error_fd) };
        if let (Some(fd), Some(script)) = (data.shell_fd.take(), data.script.take()) {
            if let Err(err) = spawn::feed_script(fd, &script) {
                // The shell died before reading its body; its exit status
                // will say so.
                debug!(job = %self, role = %role, "script feed failed: {err}");
            }
        }

        if self.state == spawning_state(role) {
            self.goto_state(ctx, next_state(self.goal, self.state));
        }

        if let Some(status) = data.status {
            self.process_terminated(ctx, role, status);
        }
    }

    /// The error pipe produced a structured setup failure.
    pub fn spawn_failed(&mut self, ctx: &mut JobCtx<'_>, role: ProcessRole, err: SpawnError) {
        if let Some(mut data) = self.pending.remove(&role) {
            data.cancel();
        }
        self.note_spawn_failure(ctx, role, err);
        if self.state == spawning_state(role) {
            self.goto_state(ctx, next_state(self.goal, self.state));
        }
    }

    fn note_spawn_failure(
        &mut self,
        ctx: &mut JobCtx<'_>,
        role: ProcessRole,
        err: SpawnError,
    ) {
        warn!(job = %self, role = %role, "failed to spawn: {err}");
        if let Some(mut log) = self.logs.remove(&role) {
            log.note(&format!("{role} process failed to start: {err}"));
        }
        self.pids.remove(&role);

        match role {
            // Logged and otherwise ignored.
            ProcessRole::PostStart | ProcessRole::PreStop => {}
            ProcessRole::Main => {
                let mut respawn = self.goal == Goal::Start
                    && self.class.respawn
                    && !ctx.disable_respawn;
                if respawn && self.catch_runaway() {
                    warn!(job = %self, "respawning too fast, stopped");
                    respawn = false;
                }
                if respawn {
                    self.goal = Goal::Respawn;
                } else {
                    self.fail(role, Some(255));
                    if self.goal == Goal::Start {
                        self.goal = Goal::Stop;
                    }
                }
            }
            _ => {
                self.fail(role, None);
                if self.goal == Goal::Start {
                    self.goal = Goal::Stop;
                }
            }
        }
    }

    /// A reaped death of one of this instance's processes.
    ///
    /// `status` carries the exit code, or the killing signal in its upper
    /// byte.
    pub fn process_terminated(
        &mut self,
        ctx: &mut JobCtx<'_>,
        role: ProcessRole,
        status: i32,
    ) {
        self.pids.remove(&role);
        if self.kill_process == Some(role) {
            self.kill_timer = None;
            self.kill_process = None;
        }

        match role {
            ProcessRole::Main => {
                self.trace_state = TraceState::None;
                self.trace_forks = 0;

                if self.goal == Goal::Start {
                    // Unexpected death; decide between respawn, failure,
                    // and a normal finish.
                    let mut respawn = self.class.respawn
                        && !ctx.disable_respawn
                        && !self.class.exit_is_normal(status);
                    if respawn && self.catch_runaway() {
                        warn!(job = %self, "respawning too fast, stopped");
                        self.fail(role, Some(status));
                        respawn = false;
                    }
                    if respawn {
                        warn!(
                            job = %self,
                            "main process ended ({}), respawning",
                            describe_status(status)
                        );
                        self.goal = Goal::Respawn;
                    } else {
                        if !self.class.exit_is_normal(status) {
                            warn!(
                                job = %self,
                                "main process {}",
                                describe_status(status)
                            );
                            self.fail(role, Some(status));
                        }
                        self.goal = Goal::Stop;
                    }
                }
                // A death in Killed (or any stop-side state) was asked
                // for; it is not a failure.
            }
            ProcessRole::Security | ProcessRole::PreStart => {
                if status != 0 {
                    warn!(
                        job = %self, role = %role,
                        "process {}",
                        describe_status(status)
                    );
                    self.fail(role, Some(status));
                    if self.goal == Goal::Start {
                        self.goal = Goal::Stop;
                    }
                }
            }
            ProcessRole::PostStart | ProcessRole::PreStop => {
                if status != 0 {
                    warn!(
                        job = %self, role = %role,
                        "process {} (ignored)",
                        describe_status(status)
                    );
                }
            }
            ProcessRole::PostStop => {
                if status != 0 {
                    warn!(
                        job = %self, role = %role,
                        "process {}",
                        describe_status(status)
                    );
                    self.fail(role, Some(status));
                    if self.goal == Goal::Start {
                        self.goal = Goal::Stop;
                    }
                }
            }
        }

        if waiting_state(role).contains(&self.state) {
            self.goto_state(ctx, next_state(self.goal, self.state));
        }
    }

    /// Whether the class expectation for leaving the spawned state has
    /// been satisfied.
    pub fn expectation_met(&self) -> bool {
        match self.class.expect {
            ExpectType::None => true,
            // The self-raised SIGSTOP is consumed by the reaper, which
            // advances the state directly.
            ExpectType::Stop => false,
            ExpectType::Fork => {
                self.trace_state == TraceState::None && self.trace_forks >= 1
            }
            ExpectType::Daemon => {
                self.trace_state == TraceState::None && self.trace_forks >= 2
            }
        }
    }

    /// The main process raised `SIGSTOP` as its readiness signal.
    pub fn main_stopped(&mut self, ctx: &mut JobCtx<'_>) {
        if self.state == JobState::Spawned {
            self.goto_state(ctx, next_state(self.goal, self.state));
        }
    }

    /// The ptrace dance finished: the tracked pid is final.
    pub fn trace_complete(&mut self, ctx: &mut JobCtx<'_>) {
        self.trace_state = TraceState::None;
        if self.state == JobState::Spawned {
            self.goto_state(ctx, next_state(self.goal, self.state));
        }
    }

    /// The event this instance was blocked on has finished handling.
    pub fn blocker_released(&mut self, ctx: &mut JobCtx<'_>) {
        self.blocker = None;
        if matches!(self.state, JobState::Starting | JobState::Stopping) {
            self.goto_state(ctx, next_state(self.goal, self.state));
        }
    }

    /// Sends the configured kill signal to the process group and arms the
    /// single kill timer.
    fn send_kill(&mut self, role: ProcessRole, pid: i32) {
        let signal = Signal::try_from(self.class.kill_signal).unwrap_or(Signal::SIGTERM);
        info!(job = %self, role = %role, pid, signal = %signal, "sending kill signal");
        kill_group(pid, signal);
        self.kill_timer =
            Some(Instant::now() + Duration::from_secs(self.class.kill_timeout));
        self.kill_process = Some(role);
    }

    /// Escalates to `SIGKILL` when the kill timer expires; fired at most
    /// once per arming.
    pub fn kill_timer_expired(&mut self) {
        let Some(role) = self.kill_process.take() else {
            return;
        };
        self.kill_timer = None;
        if let Some(&pid) = self.pids.get(&role) {
            warn!(job = %self, role = %role, pid, "kill timeout expired, sending KILL");
            kill_group(pid, Signal::SIGKILL);
        }
    }

    /// Rate-limits respawns: returns true when the limit inside the
    /// window has been exceeded.
    pub fn catch_runaway(&mut self) -> bool {
        if self.class.respawn_limit == 0 || self.class.respawn_interval == 0 {
            return false;
        }
        let interval = Duration::from_secs(self.class.respawn_interval);
        if self.respawn_time.elapsed() < interval {
            self.respawn_count += 1;
            self.respawn_count > self.class.respawn_limit
        } else {
            self.respawn_time = Instant::now();
            self.respawn_count = 1;
            false
        }
    }

    /// Records the first failure; later failures keep the original cause.
    pub fn fail(&mut self, role: ProcessRole, status: Option<i32>) {
        if self.failed {
            return;
        }
        self.failed = true;
        self.failed_process = Some(role);
        self.exit_status = status;
    }

    /// Releases everything waiting on this instance.
    fn release_blocked(&mut self, ctx: &mut JobCtx<'_>) {
        for record in self.blocking.drain(..) {
            if let Some(rest) = ctx.pool.release(record) {
                ctx.released.push(rest);
            }
        }
    }

    fn emit_job_event(
        &mut self,
        ctx: &mut JobCtx<'_>,
        name: &str,
        blocks: bool,
        with_result: bool,
    ) {
        let mut env = vec![
            format!("{JOB_ENV_KEY}={}", self.class.name),
            format!("{INSTANCE_ENV_KEY}={}", self.name),
        ];
        for exported in &self.class.export {
            if let Some(value) = environ::lookup(&self.env, exported) {
                environ::set(&mut env, &format!("{exported}={value}"));
            }
        }
        if with_result {
            for entry in self.failure_env() {
                environ::set(&mut env, &entry);
            }
            let stop_env = self.stop_env.clone();
            environ::append(&mut env, &stop_env);
        }

        let id = ctx.pool.emit(name.to_string(), env);
        if blocks {
            if let Some(event) = ctx.pool.get_mut(id) {
                event.blocking.push(Blocked::Job(self.key()));
            }
            self.blocker = Some(id);
        }
    }

    fn failure_env(&self) -> Vec<String> {
        if !self.failed {
            return vec!["RESULT=ok".to_string()];
        }
        let mut env = vec!["RESULT=failed".to_string()];
        if let Some(role) = self.failed_process {
            env.push(format!("PROCESS={role}"));
            if let Some(status) = self.exit_status {
                if (status & !0xff) != 0 {
                    env.push(format!("EXIT_SIGNAL={}", signal_name(status >> 8)));
                } else {
                    env.push(format!("EXIT_STATUS={status}"));
                }
            }
        }
        env
    }

    /// Cancels any in-flight spawns (re-exec or destruction path).
    pub fn cancel_spawns(&mut self) {
        for data in self.pending.values_mut() {
            data.cancel();
        }
    }

    /// Tears the instance down: releases blockers, waiters, and pipes.
    pub fn destroy(&mut self, ctx: &mut JobCtx<'_>) {
        if let Some(stop_on) = &mut self.stop_on {
            stop_on.reset(ctx.pool);
        }
        // Any event still naming this instance in its blocking list is
        // handled by the runtime, which drops stale job records.
        self.blocker = None;
        self.cancel_spawns();
        self.pending.clear();
        self.release_blocked(ctx);
        self.logs.clear();
    }
}

fn describe_status(status: i32) -> String {
    if (status & !0xff) != 0 {
        format!("killed by {} signal", signal_name(status >> 8))
    } else {
        format!("terminated with status {status}")
    }
}

fn kill_group(pid: i32, signal: Signal) {
    let pgid = unistd::getpgid(Some(Pid::from_raw(pid))).unwrap_or(Pid::from_raw(pid));
    if let Err(err) = nix::sys::signal::killpg(pgid, signal) {
        // The group may already be gone; fall back to the lone pid.
        if nix::sys::signal::kill(Pid::from_raw(pid), signal).is_err() {
            debug!(pid, "kill failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPool;
    use crate::expr;
    use crate::process::ProcessRole;
    use std::path::Path;

    fn ctx<'a>(pool: &'a mut EventPool, dir: &Path) -> JobCtx<'a> {
        JobCtx {
            pool,
            log_dir: dir.to_path_buf(),
            no_log: true,
            disable_respawn: false,
            system_mode: false,
            reset_console: false,
            session_chroot: None,
            released: Vec::new(),
        }
    }

    fn bare_class(name: &str) -> Rc<JobClass> {
        Rc::new(JobClass::new(name))
    }

    /// Runs main-loop ticks (drain pending, release finished, poke the
    /// job) until the pool goes quiet, collecting every finished event.
    fn pump(job: &mut Job, pool: &mut EventPool, dir: &Path) -> Vec<(String, Vec<String>)> {
        let mut seen = Vec::new();
        loop {
            let mut progressed = false;
            while pool.next_pending().is_some() {
                progressed = true;
            }
            for event in pool.reap_finished() {
                progressed = true;
                seen.push((event.name.clone(), event.env.clone()));
                for record in event.blocking {
                    if let Some(Blocked::Job(key)) = pool.release(record) {
                        assert_eq!(key, job.key());
                        let mut c = ctx(pool, dir);
                        job.blocker_released(&mut c);
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        seen
    }

    fn event_names(pool: &EventPool) -> Vec<String> {
        pool.iter().map(|(_, e)| e.name.clone()).collect()
    }

    #[test]
    fn next_state_never_regresses() {
        use JobState::*;
        let states = [
            Waiting,
            Starting,
            SecuritySpawning,
            Security,
            PreStarting,
            PreStart,
            Spawning,
            Spawned,
            PostStarting,
            PostStart,
            Running,
            PreStopping,
            PreStop,
            Stopping,
            Killed,
            PostStopping,
            PostStop,
        ];
        let rank = |state: JobState| states.iter().position(|s| *s == state).unwrap();

        for goal in [Goal::Start, Goal::Stop, Goal::Respawn] {
            for state in states {
                let once = next_state(goal, state);
                let twice = next_state(goal, once);
                // Progress may wrap only through the terminal states.
                let wraps = |from: JobState, to: JobState| {
                    matches!(from, PostStop | Waiting)
                        || matches!(to, Waiting)
                        || (goal == Goal::Start && from == PreStopping)
                        || (goal == Goal::Start && from == PreStop)
                };
                if !wraps(state, once) && !wraps(once, twice) {
                    assert!(
                        rank(twice) >= rank(once) || twice == once,
                        "{goal:?}: {state:?} -> {once:?} -> {twice:?} regressed"
                    );
                }
            }
        }
    }

    #[test]
    fn stop_cancellation_returns_to_running() {
        assert_eq!(next_state(Goal::Start, JobState::PreStop), JobState::Running);
        assert_eq!(
            next_state(Goal::Start, JobState::PreStopping),
            JobState::Running
        );
    }

    #[test]
    fn respawn_loops_through_starting() {
        assert_eq!(
            next_state(Goal::Respawn, JobState::PostStop),
            JobState::Starting
        );
        assert_eq!(next_state(Goal::Stop, JobState::PostStop), JobState::Waiting);
    }

    #[test]
    fn processless_lifecycle_runs_to_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut pool = EventPool::new();
        let class = bare_class("flag");
        let mut job = Job::new(class, String::new(), vec![], &mut pool);

        {
            let mut c = ctx(&mut pool, dir.path());
            job.change_goal(&mut c, Goal::Start);
        }
        assert_eq!(job.state, JobState::Starting);
        assert!(job.blocker.is_some());
        assert_eq!(event_names(&pool), vec!["starting"]);

        let seen = pump(&mut job, &mut pool, dir.path());
        assert_eq!(job.state, JobState::Running);
        let names: Vec<&str> = seen.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["starting", "started"]);

        {
            let mut c = ctx(&mut pool, dir.path());
            job.change_goal(&mut c, Goal::Stop);
        }
        assert_eq!(job.state, JobState::Stopping);

        let seen = pump(&mut job, &mut pool, dir.path());
        assert_eq!(job.state, JobState::Waiting);
        assert!(job.finished);

        let stopped: Vec<_> = seen
            .iter()
            .filter(|(name, _)| name == "stopped")
            .map(|(_, env)| env.clone())
            .collect();
        assert_eq!(stopped.len(), 1);
        assert!(stopped[0].contains(&"JOB=flag".to_string()));
        assert!(stopped[0].contains(&"RESULT=ok".to_string()));
    }

    #[test]
    fn service_releases_waiters_at_running_tasks_at_finish() {
        let dir = tempfile::tempdir().expect("tempdir");

        for task in [false, true] {
            let mut pool = EventPool::new();
            let mut class = JobClass::new("demo");
            class.task = task;
            let mut job = Job::new(Rc::new(class), String::new(), vec![], &mut pool);

            // Something waits on this instance: an event held blocked.
            let held = pool.emit("trigger", vec![]);
            pool.next_pending();
            pool.block(held);
            job.blocking.push(Blocked::Event(held));

            {
                let mut c = ctx(&mut pool, dir.path());
                job.change_goal(&mut c, Goal::Start);
            }
            pump(&mut job, &mut pool, dir.path());
            assert_eq!(job.state, JobState::Running);

            if task {
                let blockers = pool.get(held).expect("event retained").blockers;
                assert_eq!(blockers, 1, "task keeps its trigger blocked");
            } else {
                assert!(
                    pool.get(held).is_none(),
                    "service released its trigger, which was then freed"
                );
            }
        }
    }

    #[test]
    fn respawn_governor_counts_within_the_window() {
        let mut pool = EventPool::new();
        let mut class = JobClass::new("flaky");
        class.respawn = true;
        class.respawn_limit = 3;
        class.respawn_interval = 10;
        let mut job = Job::new(Rc::new(class), String::new(), vec![], &mut pool);

        assert!(!job.catch_runaway());
        assert!(!job.catch_runaway());
        assert!(!job.catch_runaway());
        assert!(job.catch_runaway(), "fourth respawn in the window trips");
    }

    #[test]
    fn unlimited_respawn_never_trips() {
        let mut pool = EventPool::new();
        let mut class = JobClass::new("flaky");
        class.respawn = true;
        class.respawn_limit = 0;
        let mut job = Job::new(Rc::new(class), String::new(), vec![], &mut pool);
        for _ in 0..100 {
            assert!(!job.catch_runaway());
        }
    }

    #[test]
    fn respawn_storm_fails_the_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut pool = EventPool::new();
        let mut class = JobClass::new("flaky");
        class.respawn = true;
        class.respawn_limit = 3;
        class.respawn_interval = 10;
        let class = Rc::new(class);
        let mut job = Job::new(Rc::clone(&class), String::new(), vec![], &mut pool);

        {
            let mut c = ctx(&mut pool, dir.path());
            job.change_goal(&mut c, Goal::Start);
        }
        pump(&mut job, &mut pool, dir.path());
        assert_eq!(job.state, JobState::Running);

        let mut observed = 1;
        let mut seen = Vec::new();
        loop {
            // Fake a main process dying with status 1.
            job.pids.insert(ProcessRole::Main, 4242);
            {
                let mut c = ctx(&mut pool, dir.path());
                job.process_terminated(&mut c, ProcessRole::Main, 1);
            }
            seen.extend(pump(&mut job, &mut pool, dir.path()));
            if job.state == JobState::Waiting {
                break;
            }
            assert_eq!(job.state, JobState::Running, "respawned");
            observed += 1;
            assert!(observed < 10, "respawn limit never tripped");
        }

        assert_eq!(observed, 4, "limit 3 allows three respawns");
        assert!(job.failed);
        assert_eq!(job.failed_process, Some(ProcessRole::Main));

        let stopped: Vec<_> = seen
            .iter()
            .filter(|(name, _)| name == "stopped")
            .map(|(_, env)| env.clone())
            .collect();
        assert_eq!(stopped.len(), 1);
        assert!(stopped[0].contains(&"RESULT=failed".to_string()));
        assert!(stopped[0].contains(&"PROCESS=main".to_string()));
    }

    #[test]
    fn task_exit_zero_is_a_clean_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut pool = EventPool::new();
        let mut class = JobClass::new("hello");
        class.task = true;
        let mut job = Job::new(Rc::new(class), String::new(), vec![], &mut pool);

        {
            let mut c = ctx(&mut pool, dir.path());
            job.change_goal(&mut c, Goal::Start);
        }
        pump(&mut job, &mut pool, dir.path());
        assert_eq!(job.state, JobState::Running);

        job.pids.insert(ProcessRole::Main, 4242);
        {
            let mut c = ctx(&mut pool, dir.path());
            job.process_terminated(&mut c, ProcessRole::Main, 0);
        }
        pump(&mut job, &mut pool, dir.path());
        assert_eq!(job.state, JobState::Waiting);
        assert!(!job.failed);
    }

    #[test]
    fn kill_timer_is_single_shot_and_cancelled_by_death() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut pool = EventPool::new();
        let mut job = Job::new(bare_class("sleeper"), String::new(), vec![], &mut pool);

        // Armed timer for a process that has already been reaped: expiry
        // clears the bookkeeping and signals nothing.
        job.kill_timer = Some(Instant::now());
        job.kill_process = Some(ProcessRole::Main);
        job.kill_timer_expired();
        assert!(job.kill_timer.is_none());
        assert!(job.kill_process.is_none());

        // A second expiry is a no-op.
        job.kill_timer_expired();

        // A death of the targeted role cancels an armed timer.
        job.kill_timer = Some(Instant::now() + Duration::from_secs(60));
        job.kill_process = Some(ProcessRole::Main);
        job.state = JobState::Killed;
        job.goal = Goal::Stop;
        {
            let mut c = ctx(&mut pool, dir.path());
            job.process_terminated(&mut c, ProcessRole::Main, status_from_signal(15));
        }
        assert!(job.kill_timer.is_none());
        assert!(job.kill_process.is_none());
    }

    #[test]
    fn kill_by_signal_is_distinct_from_exit_codes() {
        assert_ne!(status_from_signal(9), status_from_exit(9));
        assert_eq!(status_from_signal(9) >> 8, 9);
    }

    #[test]
    fn failure_env_describes_signal_deaths() {
        let mut pool = EventPool::new();
        let class = bare_class("demo");
        let mut job = Job::new(class, String::new(), vec![], &mut pool);

        job.fail(ProcessRole::Main, Some(status_from_signal(libc::SIGSEGV)));
        let env = job.failure_env();
        assert!(env.contains(&"RESULT=failed".to_string()));
        assert!(env.contains(&"PROCESS=main".to_string()));
        assert!(env.contains(&"EXIT_SIGNAL=SEGV".to_string()));

        let mut job2 = Job::new(bare_class("demo"), String::new(), vec![], &mut pool);
        job2.fail(ProcessRole::PreStart, Some(2));
        assert!(job2.failure_env().contains(&"EXIT_STATUS=2".to_string()));
    }

    #[test]
    fn first_failure_wins() {
        let mut pool = EventPool::new();
        let mut job = Job::new(bare_class("demo"), String::new(), vec![], &mut pool);
        job.fail(ProcessRole::PreStart, Some(1));
        job.fail(ProcessRole::Main, Some(2));
        assert_eq!(job.failed_process, Some(ProcessRole::PreStart));
        assert_eq!(job.exit_status, Some(1));
    }

    #[test]
    fn stop_on_copy_is_instance_private() {
        let mut pool = EventPool::new();
        let mut class = JobClass::new("demo");
        class.stop_on = Some(expr::parse_str("stopper", 1).unwrap());
        let class = Rc::new(class);
        let job = Job::new(Rc::clone(&class), String::new(), vec![], &mut pool);
        assert!(job.stop_on.is_some());
        assert!(!job.stop_on.as_ref().unwrap().value());
    }
}
