//! Child reaping and ptrace event dispatch.
//!
//! `SIGCHLD` only wakes the main loop; this module drains every waitable
//! child with `WNOHANG` and routes each `(pid, event, status)` triple to
//! the owning instance by looking the pid up across roles and in-flight
//! spawns. Deaths seen while a spawn's error pipe is still open are
//! latched into the pending record instead of driving the state machine.
//!
//! The ptrace dance for `expect fork`/`expect daemon` is a small Mealy
//! machine over `(TraceState, event)`; see the job's `trace_state`.

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::job::{Job, JobCtx, JobState, TraceState, status_from_exit, status_from_signal};
use crate::job_class::ExpectType;
use crate::process::ProcessRole;

/// One reportable thing that happened to a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    /// Exited normally with a code.
    Exited(i32),
    /// Killed by a signal.
    Killed(i32),
    /// Killed by a signal, with a core dump.
    Dumped(i32),
    /// Stopped by a signal (job-control stop or ptrace trap).
    Stopped(i32),
    /// Resumed by `SIGCONT`.
    Continued,
    /// `PTRACE_EVENT_FORK` fired.
    PtraceFork,
    /// `PTRACE_EVENT_EXEC` fired.
    PtraceExec,
    /// Any other ptrace notification.
    PtraceOther,
}

/// Collects the next waitable child, if any.
///
/// Uses `__WALL` so clone children of traced processes are observed too.
pub fn wait_next() -> Option<(Pid, ChildEvent)> {
    let flags = WaitPidFlag::WNOHANG
        | WaitPidFlag::WUNTRACED
        | WaitPidFlag::WCONTINUED
        | WaitPidFlag::__WALL;
    match waitpid(Pid::from_raw(-1), Some(flags)) {
        Ok(WaitStatus::StillAlive) => None,
        Ok(WaitStatus::Exited(pid, code)) => Some((pid, ChildEvent::Exited(code))),
        Ok(WaitStatus::Signaled(pid, signal, core)) => {
            let event = if core {
                ChildEvent::Dumped(signal as i32)
            } else {
                ChildEvent::Killed(signal as i32)
            };
            Some((pid, event))
        }
        Ok(WaitStatus::Stopped(pid, signal)) => {
            Some((pid, ChildEvent::Stopped(signal as i32)))
        }
        Ok(WaitStatus::Continued(pid)) => Some((pid, ChildEvent::Continued)),
        Ok(WaitStatus::PtraceEvent(pid, _, event)) => {
            let kind = if event == ptrace::Event::PTRACE_EVENT_FORK as i32 {
                ChildEvent::PtraceFork
            } else if event == ptrace::Event::PTRACE_EVENT_EXEC as i32 {
                ChildEvent::PtraceExec
            } else {
                ChildEvent::PtraceOther
            };
            Some((pid, kind))
        }
        Ok(WaitStatus::PtraceSyscall(pid)) => Some((pid, ChildEvent::PtraceOther)),
        Err(_) => None,
    }
}

/// Which role of this instance owns `pid`, live or in-flight.
pub fn role_of(job: &Job, pid: i32) -> Option<ProcessRole> {
    for (role, &owned) in &job.pids {
        if owned == pid {
            return Some(*role);
        }
    }
    for (role, data) in &job.pending {
        if data.valid && data.pid == pid {
            return Some(*role);
        }
    }
    None
}

/// Builds the status word for a death event, or `None` for non-deaths.
pub fn death_status(event: ChildEvent) -> Option<i32> {
    match event {
        ChildEvent::Exited(code) => Some(status_from_exit(code)),
        ChildEvent::Killed(signal) | ChildEvent::Dumped(signal) => {
            Some(status_from_signal(signal))
        }
        _ => None,
    }
}

/// Routes one child event into the instance state machine.
pub fn handle_child(job: &mut Job, ctx: &mut JobCtx<'_>, pid: i32, event: ChildEvent) {
    let Some(role) = role_of(job, pid) else {
        debug!(pid, ?event, "event for unknown pid ignored");
        return;
    };

    if let Some(status) = death_status(event) {
        // A death observed while the error pipe is still open happened
        // before setup completed; latch it for the spawn handler.
        let job_display = job.to_string();
        if let Some(data) = job.pending.get_mut(&role) {
            if data.valid {
                debug!(job = %job_display, role = %role, status, "latching early exit");
                data.status = Some(status);
                return;
            }
        }
        job.process_terminated(ctx, role, status);
        return;
    }

    match event {
        ChildEvent::Stopped(signal) => handle_stopped(job, ctx, pid, role, signal),
        ChildEvent::PtraceFork => handle_fork(job, ctx, pid, role),
        ChildEvent::PtraceExec => handle_exec(job, ctx, pid, role),
        ChildEvent::PtraceOther => {
            let _ = ptrace::cont(Pid::from_raw(pid), None);
        }
        ChildEvent::Continued => {}
        _ => unreachable!("deaths handled above"),
    }
}

fn tracing_main(job: &Job, role: ProcessRole) -> bool {
    role == ProcessRole::Main
        && job.trace_state != TraceState::None
        && matches!(job.state, JobState::Spawning | JobState::Spawned)
}

fn handle_stopped(
    job: &mut Job,
    ctx: &mut JobCtx<'_>,
    pid: i32,
    role: ProcessRole,
    signal: i32,
) {
    if tracing_main(job, role) {
        trace_stopped(job, pid, signal);
        return;
    }

    // An untraced main process raising SIGSTOP is the `expect stop`
    // readiness signal: acknowledge with SIGCONT and advance.
    if role == ProcessRole::Main
        && signal == libc::SIGSTOP
        && job.class.expect == ExpectType::Stop
        && job.state == JobState::Spawned
    {
        let _ = nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGCONT);
        job.main_stopped(ctx);
        return;
    }

    debug!(job = %job, role = %role, signal, "child stopped; ignoring");
}

/// The `(TraceState, signal)` half of the trace Mealy machine.
fn trace_stopped(job: &mut Job, pid: i32, signal: i32) {
    let pid = Pid::from_raw(pid);
    match (job.trace_state, signal) {
        // Freshly exec'd tracee delivered its initial trap: arm the
        // fork/exec options and let it run.
        (TraceState::New, libc::SIGTRAP) | (TraceState::NewChild, libc::SIGSTOP) => {
            let options =
                ptrace::Options::PTRACE_O_TRACEFORK | ptrace::Options::PTRACE_O_TRACEEXEC;
            if let Err(err) = ptrace::setoptions(pid, options) {
                warn!(job = %job, %pid, "failed to set trace options: {err}");
            }
            let _ = ptrace::cont(pid, None);
            job.trace_state = TraceState::Normal;
        }
        // Any other signal is not ours to eat; forward it.
        (_, signal) => {
            let forward = Signal::try_from(signal).ok();
            let _ = ptrace::cont(pid, forward);
        }
    }
}

fn handle_fork(job: &mut Job, ctx: &mut JobCtx<'_>, pid: i32, role: ProcessRole) {
    if !tracing_main(job, role) {
        let _ = ptrace::cont(Pid::from_raw(pid), None);
        return;
    }

    let parent = Pid::from_raw(pid);
    let child = match ptrace::getevent(parent) {
        Ok(msg) => msg as i32,
        Err(err) => {
            warn!(job = %job, pid, "failed to read forked pid: {err}");
            let _ = ptrace::cont(parent, None);
            return;
        }
    };

    job.trace_forks += 1;
    debug!(job = %job, pid, child, forks = job.trace_forks, "traced fork");

    // Follow the child; the old process is no longer interesting.
    let _ = ptrace::detach(parent, None);
    job.pids.insert(ProcessRole::Main, child);

    let needed = match job.class.expect {
        ExpectType::Fork => 1,
        ExpectType::Daemon => 2,
        _ => u32::MAX,
    };
    if job.trace_forks >= needed {
        // The child is trace-stopped at birth; release it and move on.
        let _ = ptrace::detach(Pid::from_raw(child), None);
        job.trace_complete(ctx);
    } else {
        job.trace_state = TraceState::NewChild;
    }
}

fn handle_exec(job: &mut Job, ctx: &mut JobCtx<'_>, pid: i32, role: ProcessRole) {
    if !tracing_main(job, role) {
        let _ = ptrace::cont(Pid::from_raw(pid), None);
        return;
    }

    if job.trace_forks >= 1 {
        // The daemon exec'd its final image early; stop waiting for more
        // forks and adopt what we have.
        let _ = ptrace::detach(Pid::from_raw(pid), None);
        job.trace_complete(ctx);
    } else {
        let _ = ptrace::cont(Pid::from_raw(pid), None);
    }
}
