//! The daemon runtime: directory resolution, the context struct owning
//! every table, and the single-threaded cooperative main loop.
//!
//! The loop blocks in exactly one place — a `poll` over the signalfd, the
//! control socket, per-spawn error pipes, and pty masters — and then
//! dispatches. Handlers never block and never re-enter the loop; anything
//! that wants to start or stop a job does so through goal changes that
//! resolve within the tick.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::Utc;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, sigprocmask};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::unistd::{self, Pid};
use tracing::{debug, error, info, warn};

use crate::config;
use crate::control::{
    self, ControlCommand, ControlResponse, JobSnapshot, StatusSnapshot,
};
use crate::environ;
use crate::error::DaemonError;
use crate::event::{Blocked, EventPool, JobKey};
use crate::job::{Goal, Job, JobCtx, JobState};
use crate::job_class::{ClassRegistry, ConsoleType, JobClass};
use crate::operator::EventExpression;
use crate::paths::{
    CTRLALTDEL_EVENT, DEFAULT_CONFDIR, DEFAULT_LOGDIR, EVENTS_ENV_KEY, KBDREQUEST_EVENT,
    LOOP_IDLE_TIMEOUT, PWRSTATUS_EVENT, STARTUP_EVENT, SUBREAPER_FAILED_EVENT,
    USER_CONFDIR,
};
use crate::process::ProcessRole;
use crate::reaper;
use crate::spawn::{self, ErrorPipeEvent};
use crate::state;

/// Whether the daemon runs as the system init or a per-user instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// System service manager; state under `/run`, config under `/etc`.
    System,
    /// Per-user (or per-session) manager; paths follow the XDG spec.
    User,
}

/// Resolved invocation options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Mode the daemon runs in.
    pub mode: RuntimeMode,
    /// Directories searched for job definitions, in order.
    pub confdirs: Vec<PathBuf>,
    /// Directory job logs are written under.
    pub logdir: PathBuf,
    /// Console policy for classes without a `console` stanza.
    pub default_console: ConsoleType,
    /// Disable the job log writer entirely.
    pub no_log: bool,
    /// Ignore session bindings.
    pub no_sessions: bool,
    /// Suppress the boot event.
    pub no_startup_event: bool,
    /// Name of the boot event.
    pub startup_event: String,
    /// This process is a re-exec of a previous daemon.
    pub restart: bool,
    /// Descriptor to read serialised state from on re-exec.
    pub state_fd: Option<RawFd>,
}

impl Options {
    /// System-mode defaults.
    pub fn system() -> Self {
        Self {
            mode: RuntimeMode::System,
            confdirs: vec![PathBuf::from(DEFAULT_CONFDIR)],
            logdir: PathBuf::from(DEFAULT_LOGDIR),
            default_console: ConsoleType::Log,
            no_log: false,
            no_sessions: false,
            no_startup_event: false,
            startup_event: STARTUP_EVENT.to_string(),
            restart: false,
            state_fd: None,
        }
    }

    /// User-mode defaults, following XDG base directories.
    pub fn user() -> Self {
        Self {
            mode: RuntimeMode::User,
            confdirs: user_confdirs(),
            logdir: user_logdir(),
            ..Self::system()
        }
    }
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// `$XDG_CONFIG_HOME/emberd` plus each `$XDG_CONFIG_DIRS` entry.
pub fn user_confdirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let config_home = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".config"));
    dirs.push(config_home.join(USER_CONFDIR));

    let config_dirs = env::var("XDG_CONFIG_DIRS").unwrap_or_else(|_| "/etc/xdg".into());
    for entry in config_dirs.split(':').filter(|entry| !entry.is_empty()) {
        dirs.push(PathBuf::from(entry).join(USER_CONFDIR));
    }
    dirs
}

fn user_logdir() -> PathBuf {
    let data_home = env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".local/share"));
    data_home.join(USER_CONFDIR).join("logs")
}

/// Directory for the control socket and daemon lock.
pub fn runtime_dir(mode: RuntimeMode) -> PathBuf {
    match mode {
        RuntimeMode::System => PathBuf::from("/run").join(USER_CONFDIR),
        RuntimeMode::User => env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".cache"))
            .join(USER_CONFDIR),
    }
}

/// How the main loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean shutdown was requested.
    Shutdown,
}

enum PollTarget {
    Signals,
    Listener,
    Spawn(JobKey, ProcessRole),
    Log(JobKey, ProcessRole),
}

/// The whole-daemon context: every global table, owned by the loop.
pub struct Daemon {
    opts: Options,
    runtime_dir: PathBuf,
    _lock: File,
    listener: UnixListener,
    signal_fd: SignalFd,
    registry: ClassRegistry,
    /// Live per-class start conditions, matched against incoming events.
    start_conditions: BTreeMap<String, EventExpression>,
    jobs: BTreeMap<JobKey, Job>,
    pool: EventPool,
    sessions: HashMap<String, Option<String>>,
    control_serial: u64,
    shutdown: bool,
    reexec_requested: bool,
}

impl Daemon {
    /// Boots the daemon: locks the runtime directory, arms signals and
    /// the subreaper, then either restores serialised state or loads the
    /// configuration directories fresh.
    pub fn new(opts: Options) -> Result<Self, DaemonError> {
        let runtime_dir = runtime_dir(opts.mode);
        let lock = control::lock_runtime_dir(&runtime_dir)?;
        let listener = control::bind(&runtime_dir)?;

        let signal_fd = arm_signals()?;
        install_crash_handler();
        let subreaper_ok = register_subreaper();

        let mut daemon = Self {
            opts,
            runtime_dir,
            _lock: lock,
            listener,
            signal_fd,
            registry: ClassRegistry::new(),
            start_conditions: BTreeMap::new(),
            jobs: BTreeMap::new(),
            pool: EventPool::new(),
            sessions: HashMap::new(),
            control_serial: 0,
            shutdown: false,
            reexec_requested: false,
        };

        if !subreaper_ok {
            daemon.pool.emit(SUBREAPER_FAILED_EVENT, vec![]);
        }

        let mut restored = false;
        if daemon.opts.restart {
            if let Some(fd) = daemon.opts.state_fd {
                match state::read_state(fd).and_then(state::restore) {
                    Ok(world) => {
                        daemon.adopt(world);
                        restored = true;
                        info!("state restored from predecessor");
                    }
                    Err(err) => {
                        error!("failed to restore state: {err}; retrying stateless");
                        reexec_self(&daemon.opts, None);
                        // Exec failed; carry on with a cold boot.
                    }
                }
            }
        }

        if !restored {
            daemon.load_configuration();
            if !daemon.opts.no_startup_event && !daemon.opts.restart {
                let name = daemon.opts.startup_event.clone();
                daemon.pool.emit(name, vec![]);
            }
        } else {
            // The pipe and every carried descriptor went through the
            // exec with close-on-exec cleared; re-arm the flag.
            for job in daemon.jobs.values() {
                for data in job.pending.values() {
                    state::set_cloexec(data.error_fd, true);
                    if let Some(fd) = data.shell_fd {
                        state::set_cloexec(fd, true);
                    }
                }
                for log in job.logs.values() {
                    if let Some(fd) = log.fd {
                        state::set_cloexec(fd, true);
                    }
                }
            }
        }

        Ok(daemon)
    }

    fn adopt(&mut self, world: state::RestoredState) {
        self.sessions = world.sessions;
        self.pool = world.pool;
        self.start_conditions = world.start_conditions;
        self.jobs = world.jobs;
        for class in world.classes {
            let deleted = class.deleted.get();
            let name = class.name.clone();
            self.registry.install(class, false);
            if deleted {
                self.registry.remove(&name, true);
            }
        }
    }

    fn job_ctx<'a>(
        pool: &'a mut EventPool,
        opts: &Options,
        sessions: &HashMap<String, Option<String>>,
        class: &JobClass,
    ) -> JobCtx<'a> {
        let session_chroot = if opts.no_sessions {
            None
        } else {
            class
                .session
                .as_ref()
                .and_then(|name| sessions.get(name).cloned())
                .flatten()
        };
        JobCtx {
            pool,
            log_dir: opts.logdir.clone(),
            no_log: opts.no_log,
            disable_respawn: false,
            system_mode: opts.mode == RuntimeMode::System,
            reset_console: !opts.restart,
            session_chroot,
            released: Vec::new(),
        }
    }

    fn drain_released(&mut self, released: Vec<Blocked>) {
        for record in released {
            match record {
                Blocked::Control { serial, mut stream } => {
                    debug!(serial, "answering deferred control client");
                    let _ = control::write_response(&mut stream, &ControlResponse::Ok);
                }
                Blocked::Event(_) | Blocked::Job(_) => {
                    // Event records were already released by the pool;
                    // job records are routed by the event-finish pass.
                }
            }
        }
    }

    /// Runs one job-machine call with a fresh context and routes any
    /// released control clients.
    fn with_job<F>(&mut self, key: &JobKey, call: F)
    where
        F: FnOnce(&mut Job, &mut JobCtx<'_>),
    {
        let Self {
            jobs,
            pool,
            opts,
            sessions,
            ..
        } = self;
        let Some(job) = jobs.get_mut(key) else {
            return;
        };
        let class = Rc::clone(&job.class);
        let mut ctx = Self::job_ctx(pool, opts, sessions, &class);
        call(job, &mut ctx);
        let released = std::mem::take(&mut ctx.released);
        self.drain_released(released);
    }

    /// Loads (or reloads) every configuration directory, applying the
    /// install/stash/tombstone rules.
    pub fn load_configuration(&mut self) {
        let mut seen: Vec<String> = Vec::new();
        for dir in self.opts.confdirs.clone() {
            let (classes, failures) =
                config::load_job_dir(&dir, self.opts.default_console);
            for (path, err) in failures {
                warn!(file = %path.display(), "ignored: {err}");
            }
            for class in classes {
                // Earlier directories win.
                if seen.contains(&class.name) {
                    continue;
                }
                seen.push(class.name.clone());
                self.install_class(Rc::new(class));
            }
        }

        // Classes that disappeared from every directory.
        for name in self.registry.names() {
            if !seen.contains(&name) {
                let in_use = self.has_instances(&name);
                if let Some(mut condition) = self.start_conditions.remove(&name) {
                    condition.reset(&mut self.pool);
                }
                self.registry.remove(&name, in_use);
                info!(class = %name, "definition removed");
            }
        }
    }

    fn has_instances(&self, class: &str) -> bool {
        self.jobs.values().any(|job| job.class.name == class)
    }

    fn install_class(&mut self, class: Rc<JobClass>) {
        let name = class.name.clone();
        let in_use = self.has_instances(&name);
        if self.registry.install(Rc::clone(&class), in_use) {
            if let Some(mut old) = self.start_conditions.remove(&name) {
                old.reset(&mut self.pool);
            }
            if let Some(template) = &class.start_on {
                self.start_conditions
                    .insert(name, template.copy(&mut self.pool));
            }
        }
    }

    /// The main loop. Returns when a shutdown completes or a requested
    /// re-exec could not exec.
    pub fn run(&mut self) -> ExitReason {
        loop {
            self.destroy_finished();

            if self.reexec_requested {
                self.reexec();
                // Only reached when the exec failed; keep running.
                self.reexec_requested = false;
                continue;
            }
            if self.shutdown && self.jobs.is_empty() {
                control::cleanup(&self.runtime_dir);
                return ExitReason::Shutdown;
            }

            self.poll_and_dispatch();
            // The queue left over from the previous tick drains before
            // any new process deaths are handled.
            self.drain_events();
            self.reap();
            self.expire_kill_timers();
            self.drain_events();
            self.finish_events();
        }
    }

    fn destroy_finished(&mut self) {
        let doomed: Vec<JobKey> = self
            .jobs
            .iter()
            .filter(|(_, job)| {
                job.finished && job.state == JobState::Waiting && job.goal == Goal::Stop
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in doomed {
            info!(job = %key, "instance finished");
            self.with_job(&key, |job, ctx| job.destroy(ctx));
            self.jobs.remove(&key);

            let in_use = self.has_instances(&key.class);
            if let Some(new_class) = self.registry.reconsider(&key.class, in_use) {
                if let Some(mut old) = self.start_conditions.remove(&key.class) {
                    old.reset(&mut self.pool);
                }
                if let Some(template) = &new_class.start_on {
                    self.start_conditions
                        .insert(key.class.clone(), template.copy(&mut self.pool));
                }
            } else if self.registry.get(&key.class).is_none() {
                if let Some(mut old) = self.start_conditions.remove(&key.class) {
                    old.reset(&mut self.pool);
                }
            }
        }
    }

    fn poll_timeout(&self) -> Duration {
        if self.pool.has_pending() {
            return Duration::ZERO;
        }
        let now = Instant::now();
        self.jobs
            .values()
            .filter_map(|job| job.kill_timer)
            .map(|deadline| deadline.saturating_duration_since(now))
            .min()
            .unwrap_or(LOOP_IDLE_TIMEOUT)
    }

    fn poll_and_dispatch(&mut self) {
        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut targets: Vec<PollTarget> = Vec::new();

        fds.push(libc::pollfd {
            fd: self.signal_fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        targets.push(PollTarget::Signals);

        fds.push(libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        targets.push(PollTarget::Listener);

        for (key, job) in &self.jobs {
            for (role, data) in &job.pending {
                if data.valid {
                    fds.push(libc::pollfd {
                        fd: data.error_fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                    targets.push(PollTarget::Spawn(key.clone(), *role));
                }
            }
            for (role, log) in &job.logs {
                if let Some(fd) = log.fd {
                    fds.push(libc::pollfd {
                        fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                    targets.push(PollTarget::Log(key.clone(), *role));
                }
            }
        }

        let timeout = self.poll_timeout().as_millis().min(i32::MAX as u128) as i32;
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ready <= 0 {
            return;
        }

        for (pollfd, target) in fds.iter().zip(targets) {
            if pollfd.revents == 0 {
                continue;
            }
            match target {
                PollTarget::Signals => self.drain_signals(),
                PollTarget::Listener => self.accept_control(),
                PollTarget::Spawn(key, role) => self.spawn_pipe_event(&key, role),
                PollTarget::Log(key, role) => {
                    if let Some(job) = self.jobs.get_mut(&key) {
                        if let Some(log) = job.logs.get_mut(&role) {
                            log.drain();
                        }
                    }
                }
            }
        }
    }

    fn spawn_pipe_event(&mut self, key: &JobKey, role: ProcessRole) {
        let Some(job) = self.jobs.get(key) else {
            return;
        };
        let Some(data) = job.pending.get(&role) else {
            return;
        };
        if !data.valid {
            return;
        }
        match spawn::read_error_pipe(data.error_fd) {
            ErrorPipeEvent::Pending => {}
            ErrorPipeEvent::Success => {
                self.with_job(key, |job, ctx| job.spawn_succeeded(ctx, role));
            }
            ErrorPipeEvent::Failed(err) => {
                self.with_job(key, |job, ctx| job.spawn_failed(ctx, role, err));
            }
        }
    }

    fn drain_signals(&mut self) {
        while let Ok(Some(info)) = self.signal_fd.read_signal() {
            let signo = info.ssi_signo as i32;
            match Signal::try_from(signo) {
                Ok(Signal::SIGCHLD) | Ok(Signal::SIGALRM) => {
                    // Only here to wake the loop; reaping runs each tick.
                }
                Ok(Signal::SIGTERM) => {
                    info!("SIGTERM received; performing stateful re-exec");
                    self.reexec_requested = true;
                }
                Ok(Signal::SIGHUP) => {
                    info!("SIGHUP received; reloading configuration");
                    self.load_configuration();
                }
                Ok(Signal::SIGUSR1) => match control::bind(&self.runtime_dir) {
                    Ok(listener) => {
                        info!("control socket rebound");
                        self.listener = listener;
                    }
                    Err(err) => warn!("failed to rebind control socket: {err}"),
                },
                Ok(Signal::SIGINT) => {
                    self.pool.emit(CTRLALTDEL_EVENT, vec![]);
                }
                Ok(Signal::SIGWINCH) => {
                    self.pool.emit(KBDREQUEST_EVENT, vec![]);
                }
                Ok(Signal::SIGPWR) => {
                    self.pool.emit(PWRSTATUS_EVENT, vec![]);
                }
                _ => debug!(signo, "unhandled signal"),
            }
        }
    }

    fn reap(&mut self) {
        while let Some((pid, event)) = reaper::wait_next() {
            let pid = pid.as_raw();
            let owner = self
                .jobs
                .iter()
                .find(|(_, job)| reaper::role_of(job, pid).is_some())
                .map(|(key, _)| key.clone());
            match owner {
                Some(key) => {
                    self.with_job(&key, |job, ctx| {
                        reaper::handle_child(job, ctx, pid, event);
                    });
                }
                None => debug!(pid, ?event, "reaped unknown child"),
            }
        }
    }

    fn expire_kill_timers(&mut self) {
        let now = Instant::now();
        let expired: Vec<JobKey> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.kill_timer.is_some_and(|deadline| deadline <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(job) = self.jobs.get_mut(&key) {
                job.kill_timer_expired();
            }
        }
    }

    /// Drains the event queue: each event is matched against every start
    /// condition and every instance's stop condition, in that order.
    fn drain_events(&mut self) {
        while let Some(id) = self.pool.next_pending() {
            let name = self
                .pool
                .get(id)
                .map(|event| event.name.clone())
                .unwrap_or_default();
            debug!(event = %name, "handling event");

            // Start conditions, in class-name order (stable across ticks).
            let mut satisfied: Vec<String> = Vec::new();
            for (class_name, condition) in self.start_conditions.iter_mut() {
                condition.handle(&mut self.pool, id, &[]);
                if condition.value() {
                    satisfied.push(class_name.clone());
                }
            }
            for class_name in satisfied {
                self.start_instance_for(&class_name);
            }

            // Stop conditions, per instance, expanded against the
            // instance environment.
            let keys: Vec<JobKey> = self.jobs.keys().cloned().collect();
            for key in keys {
                self.check_stop_condition(&key, id);
            }
        }
    }

    fn check_stop_condition(&mut self, key: &JobKey, id: usize) {
        let mut stop_env: Option<Vec<String>> = None;
        {
            let Self { jobs, pool, .. } = self;
            let Some(job) = jobs.get_mut(key) else {
                return;
            };
            let Job {
                stop_on: Some(stop_on),
                env,
                ..
            } = job
            else {
                return;
            };
            stop_on.handle(pool, id, env);
            if stop_on.value() {
                let mut collected = Vec::new();
                stop_on.environment(pool, &mut collected, Some(EVENTS_ENV_KEY));
                stop_on.reset(pool);
                stop_env = Some(collected);
            }
        }

        if let Some(collected) = stop_env {
            if let Some(job) = self.jobs.get_mut(key) {
                job.stop_env = collected;
            }
            self.with_job(key, |job, ctx| job.change_goal(ctx, Goal::Stop));
        }
    }

    /// A start condition became satisfied: materialise (or re-goal) the
    /// instance, transferring the contributing events onto its waiter
    /// list.
    fn start_instance_for(&mut self, class_name: &str) {
        let Some(class) = self.registry.get(class_name).cloned() else {
            return;
        };
        let Some(condition) = self.start_conditions.get_mut(class_name) else {
            return;
        };

        let mut start_env = class.environment();
        condition.environment(&self.pool, &mut start_env, Some(EVENTS_ENV_KEY));
        let blocked = condition.events(&mut self.pool);
        condition.reset(&mut self.pool);

        let instance = if class.instance.is_empty() {
            String::new()
        } else {
            match environ::expand(&class.instance, &start_env) {
                Ok(expanded) => expanded,
                Err(_) => {
                    warn!(class = %class_name, "instance template failed to expand");
                    for record in blocked {
                        self.pool.release(record);
                    }
                    return;
                }
            }
        };

        let key = JobKey::new(class_name.to_string(), instance.clone());
        if let Some(existing) = self.jobs.get_mut(&key) {
            if existing.goal == Goal::Stop {
                existing.env = start_env;
                existing.blocking.extend(blocked);
                self.with_job(&key, |job, ctx| job.change_goal(ctx, Goal::Start));
            } else {
                // Already starting or running; the trigger has no one to
                // wait for.
                for record in blocked {
                    self.pool.release(record);
                }
            }
            return;
        }

        info!(job = %key, "instance created");
        let mut job = Job::new(Rc::clone(&class), instance, start_env, &mut self.pool);
        job.blocking.extend(blocked);
        self.jobs.insert(key.clone(), job);
        self.with_job(&key, |job, ctx| job.change_goal(ctx, Goal::Start));
    }

    /// Releases the waiter lists of events whose blockers drained.
    fn finish_events(&mut self) {
        loop {
            let finished = self.pool.reap_finished();
            if finished.is_empty() {
                break;
            }
            for event in finished {
                for record in event.blocking {
                    match self.pool.release(record) {
                        Some(Blocked::Job(key)) => {
                            self.with_job(&key, |job, ctx| job.blocker_released(ctx));
                        }
                        Some(Blocked::Control { serial, mut stream }) => {
                            debug!(serial, "event finished; answering control client");
                            let _ = control::write_response(
                                &mut stream,
                                &ControlResponse::Ok,
                            );
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn accept_control(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _)) => {
                    let _ = stream.set_nonblocking(false);
                    match control::read_command(&mut stream) {
                        Ok(command) => self.handle_command(stream, command),
                        Err(err) => {
                            warn!("invalid control command: {err}");
                            let _ = control::write_response(
                                &mut stream,
                                &ControlResponse::Error(err.to_string()),
                            );
                        }
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("control accept failed: {err}");
                    break;
                }
            }
        }
    }

    fn handle_command(
        &mut self,
        mut stream: std::os::unix::net::UnixStream,
        command: ControlCommand,
    ) {
        debug!(?command, "control command");
        match command {
            ControlCommand::EmitEvent { name, env, wait } => {
                let id = self.pool.emit(name, env);
                if wait {
                    self.park_on_event(id, stream);
                } else {
                    let _ = control::write_response(&mut stream, &ControlResponse::Ok);
                }
            }
            ControlCommand::Start { job, env, wait } => {
                self.control_start(&job, env, stream, wait);
            }
            ControlCommand::Stop { job, env, wait } => {
                self.control_stop(&job, env, stream, wait);
            }
            ControlCommand::Restart { job } => {
                let keys: Vec<JobKey> = self
                    .jobs
                    .keys()
                    .filter(|key| key.class == job)
                    .cloned()
                    .collect();
                if keys.is_empty() {
                    let _ = control::write_response(
                        &mut stream,
                        &ControlResponse::Error(format!("job '{job}' is not running")),
                    );
                    return;
                }
                for key in keys {
                    self.with_job(&key, |job, ctx| job.change_goal(ctx, Goal::Respawn));
                }
                let _ = control::write_response(
                    &mut stream,
                    &ControlResponse::Message(format!("restarting {job}")),
                );
            }
            ControlCommand::Reload { job } => {
                let mut signalled = 0;
                for instance in self.jobs.values().filter(|j| j.class.name == job) {
                    if let Some(&pid) = instance.pids.get(&ProcessRole::Main) {
                        let signal = Signal::try_from(instance.class.reload_signal)
                            .unwrap_or(Signal::SIGHUP);
                        if nix::sys::signal::kill(Pid::from_raw(pid), signal).is_ok() {
                            signalled += 1;
                        }
                    }
                }
                let response = if signalled > 0 {
                    ControlResponse::Message(format!("reloaded {signalled} instance(s)"))
                } else {
                    ControlResponse::Error(format!("job '{job}' has no main process"))
                };
                let _ = control::write_response(&mut stream, &response);
            }
            ControlCommand::Status => {
                let snapshot = self.snapshot();
                let _ = control::write_response(
                    &mut stream,
                    &ControlResponse::Status(snapshot),
                );
            }
            ControlCommand::ListJobs => {
                let _ = control::write_response(
                    &mut stream,
                    &ControlResponse::Jobs(self.registry.names()),
                );
            }
            ControlCommand::ReloadConfiguration => {
                self.load_configuration();
                let _ = control::write_response(&mut stream, &ControlResponse::Ok);
            }
            ControlCommand::Shutdown => {
                info!("shutdown requested");
                self.shutdown = true;
                let keys: Vec<JobKey> = self.jobs.keys().cloned().collect();
                for key in keys {
                    self.with_job(&key, |job, ctx| job.change_goal(ctx, Goal::Stop));
                }
                let _ = control::write_response(&mut stream, &ControlResponse::Ok);
            }
        }
    }

    fn park_on_event(&mut self, id: usize, stream: std::os::unix::net::UnixStream) {
        self.control_serial += 1;
        let serial = self.control_serial;
        if let Some(event) = self.pool.get_mut(id) {
            event.blocking.push(Blocked::Control { serial, stream });
        }
    }

    fn control_start(
        &mut self,
        class_name: &str,
        env: Vec<String>,
        mut stream: std::os::unix::net::UnixStream,
        wait: bool,
    ) {
        let Some(class) = self.registry.get(class_name).cloned() else {
            let _ = control::write_response(
                &mut stream,
                &ControlResponse::Error(format!("unknown job '{class_name}'")),
            );
            return;
        };

        let mut start_env = class.environment();
        environ::append(&mut start_env, &env);
        let instance = match environ::expand(&class.instance, &start_env) {
            Ok(expanded) => expanded,
            Err(_) => {
                let usage = class
                    .usage
                    .clone()
                    .unwrap_or_else(|| "missing instance variables".into());
                let _ = control::write_response(
                    &mut stream,
                    &ControlResponse::Error(usage),
                );
                return;
            }
        };

        let key = JobKey::new(class_name.to_string(), instance.clone());
        if !self.jobs.contains_key(&key) {
            let job = Job::new(Rc::clone(&class), instance, start_env, &mut self.pool);
            self.jobs.insert(key.clone(), job);
        }

        if wait {
            // Parked until the instance finishes its transition: running
            // for services, finished for tasks.
            self.control_serial += 1;
            let serial = self.control_serial;
            if let Some(job) = self.jobs.get_mut(&key) {
                job.blocking.push(Blocked::Control { serial, stream });
            }
        } else {
            let _ = control::write_response(
                &mut stream,
                &ControlResponse::Message(format!("start scheduled for {key}")),
            );
        }
        self.with_job(&key, |job, ctx| job.change_goal(ctx, Goal::Start));
    }

    fn control_stop(
        &mut self,
        class_name: &str,
        env: Vec<String>,
        mut stream: std::os::unix::net::UnixStream,
        wait: bool,
    ) {
        let keys: Vec<JobKey> = self
            .jobs
            .keys()
            .filter(|key| key.class == class_name)
            .cloned()
            .collect();
        if keys.is_empty() {
            let _ = control::write_response(
                &mut stream,
                &ControlResponse::Error(format!("job '{class_name}' is not running")),
            );
            return;
        }

        let mut parked = if wait {
            Some(stream)
        } else {
            let _ = control::write_response(
                &mut stream,
                &ControlResponse::Message(format!("stop scheduled for {class_name}")),
            );
            None
        };
        for key in keys {
            if let Some(job) = self.jobs.get_mut(&key) {
                job.stop_env = env.clone();
                if let Some(stream) = parked.take() {
                    self.control_serial += 1;
                    let serial = self.control_serial;
                    job.blocking.push(Blocked::Control { serial, stream });
                }
            }
            self.with_job(&key, |job, ctx| job.change_goal(ctx, Goal::Stop));
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            captured_at: Utc::now(),
            jobs: self
                .jobs
                .values()
                .map(|job| JobSnapshot {
                    class: job.class.name.clone(),
                    instance: job.name.clone(),
                    goal: job.goal.to_string(),
                    state: job.state.to_string(),
                    pids: job
                        .pids
                        .iter()
                        .map(|(role, pid)| (role.to_string(), *pid))
                        .collect(),
                })
                .collect(),
        }
    }

    /// Marshals the world and replaces this image with a fresh one.
    fn reexec(&mut self) {
        info!("serialising state for re-exec");

        // Deferred control clients cannot cross an exec; give them an
        // interim answer now.
        let mut parked: Vec<Blocked> = Vec::new();
        for job in self.jobs.values_mut() {
            let (control, rest): (Vec<Blocked>, Vec<Blocked>) = job
                .blocking
                .drain(..)
                .partition(|record| matches!(record, Blocked::Control { .. }));
            job.blocking = rest;
            parked.extend(control);
        }
        parked.extend(self.pool.drain_control_waiters());
        for record in parked {
            if let Blocked::Control { mut stream, .. } = record {
                let _ = control::write_response(
                    &mut stream,
                    &ControlResponse::Message("daemon restarting".into()),
                );
            }
        }

        let doc = match state::build(
            &self.sessions,
            &self.pool,
            &self.registry,
            &self.start_conditions,
            &self.jobs,
        ) {
            Ok(doc) => doc,
            Err(err) => {
                error!("could not serialise state: {err}; re-exec aborted");
                return;
            }
        };

        let (read_fd, write_fd) = match unistd::pipe() {
            Ok(pair) => {
                use std::os::unix::io::IntoRawFd;
                (pair.0.into_raw_fd(), pair.1.into_raw_fd())
            }
            Err(err) => {
                error!("could not create state pipe: {err}; re-exec aborted");
                return;
            }
        };
        // The write side must vanish at exec so the successor sees EOF;
        // the read side and every referenced descriptor must survive.
        state::set_cloexec(write_fd, true);
        state::set_cloexec(read_fd, false);
        for fd in state::referenced_fds(&doc) {
            state::set_cloexec(fd, false);
        }

        if let Err(err) = state::write_state(write_fd, &doc) {
            error!("could not write state: {err}; falling back to stateless re-exec");
            reexec_self(&self.opts, None);
            return;
        }

        reexec_self(&self.opts, Some(read_fd));

        // Exec failed; make the descriptors private again and carry on.
        error!("re-exec failed; continuing with the current image");
        state::set_cloexec(read_fd, true);
        for fd in state::referenced_fds(&doc) {
            state::set_cloexec(fd, true);
        }
    }
}

fn arm_signals() -> Result<SignalFd, DaemonError> {
    let mut mask = SigSet::empty();
    for signal in [
        Signal::SIGCHLD,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGUSR1,
        Signal::SIGINT,
        Signal::SIGWINCH,
        Signal::SIGALRM,
        Signal::SIGPWR,
    ] {
        mask.add(signal);
    }
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
    let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
    Ok(fd)
}

/// `SIGSEGV`/`SIGABRT`: fork a child that restores the default
/// disposition and re-raises, so a core dump is produced without losing
/// the parent's exit status; the parent exits with the signal number.
extern "C" fn crash_handler(signo: libc::c_int) {
    unsafe {
        let pid = libc::fork();
        if pid == 0 {
            libc::signal(signo, libc::SIG_DFL);
            libc::raise(signo);
            libc::_exit(255);
        }
        if pid > 0 {
            let mut status = 0;
            libc::waitpid(pid, &mut status, 0);
        }
        libc::_exit(signo);
    }
}

fn install_crash_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = crash_handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGABRT, &action, std::ptr::null_mut());
    }
}

/// Registers as a child subreaper when not PID 1, so daemonised
/// descendants reparent to us and stay observable. Returns whether the
/// registration (or being PID 1) succeeded.
fn register_subreaper() -> bool {
    if unistd::getpid().as_raw() == 1 {
        return true;
    }
    let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    if rc != 0 {
        warn!("unable to register as child subreaper");
        return false;
    }
    true
}

/// Replaces the current image with a fresh copy of ourselves.
///
/// With `state_fd` the successor boots `--restart --state-fd N`; without
/// it the restart is stateless.
pub fn reexec_self(opts: &Options, state_fd: Option<RawFd>) {
    let exe = CString::new("/proc/self/exe").expect("static string");
    let mut args: Vec<CString> = vec![CString::new("emberd").expect("static string")];

    if opts.mode == RuntimeMode::User {
        args.push(CString::new("--user").expect("static string"));
    }
    for dir in &opts.confdirs {
        args.push(CString::new("--confdir").expect("static string"));
        if let Ok(arg) = CString::new(dir.to_string_lossy().into_owned()) {
            args.push(arg);
        }
    }
    args.push(CString::new("--logdir").expect("static string"));
    if let Ok(arg) = CString::new(opts.logdir.to_string_lossy().into_owned()) {
        args.push(arg);
    }
    if opts.no_log {
        args.push(CString::new("--no-log").expect("static string"));
    }
    if opts.no_sessions {
        args.push(CString::new("--no-sessions").expect("static string"));
    }
    args.push(CString::new("--no-startup-event").expect("static string"));
    args.push(CString::new("--restart").expect("static string"));
    if let Some(fd) = state_fd {
        args.push(CString::new("--state-fd").expect("static string"));
        args.push(CString::new(fd.to_string()).expect("fd digits"));
    }

    let _ = unistd::execv(&exe, &args);
    // Only reached on failure.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_defaults_use_well_known_paths() {
        let opts = Options::system();
        assert_eq!(opts.confdirs, vec![PathBuf::from("/etc/emberd")]);
        assert_eq!(opts.logdir, PathBuf::from("/var/log/emberd"));
        assert_eq!(opts.startup_event, "startup");
        assert!(!opts.restart);
    }

    #[test]
    fn runtime_dirs_differ_by_mode() {
        assert_eq!(
            runtime_dir(RuntimeMode::System),
            PathBuf::from("/run/emberd")
        );
        let user = runtime_dir(RuntimeMode::User);
        assert!(user.ends_with("emberd"));
    }

    #[test]
    fn user_confdirs_follow_xdg() {
        let dirs = user_confdirs();
        assert!(!dirs.is_empty());
        assert!(dirs.iter().all(|dir| dir.ends_with("emberd")));
    }
}
