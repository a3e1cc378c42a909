//! Controlled process spawning.
//!
//! Between `fork` and `exec` the child walks a fixed sequence of setup
//! steps: pty/console wiring, script descriptor placement, session
//! leadership, resource limits, privilege dropping, cgroup membership,
//! signal reset, and optional ptrace arming. Every failure is reported
//! structurally as a `{type, arg, errno}` record over a dedicated pipe and
//! the child exits 255; a clean close of that pipe means `execvp` ran.
//!
//! Nothing in the child may log; the error pipe is its only voice. All
//! argv/envp allocation happens before `fork` so the child sticks to raw
//! syscalls wherever it can.

use std::ffi::CString;
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd::{self, ForkResult, Gid, Group, Uid, User};
use tracing::warn;

use crate::environ;
use crate::error::{SpawnError, SpawnErrorKind};
use crate::job_class::{ApparmorPolicy, ConsoleType, JobClass};
use crate::log::Log;
use crate::paths::{FORK_RETRY_DELAY, SCRIPT_FD};
use crate::process::{Interpretation, ProcessRole};

/// Everything the spawner needs to start one process of one instance.
pub struct SpawnRequest<'a> {
    /// The job class being spawned from.
    pub class: &'a JobClass,
    /// Expanded instance name, for diagnostics and `$NAME` expansion.
    pub instance: &'a str,
    /// Which slot is being spawned.
    pub role: ProcessRole,
    /// Complete environment for the child.
    pub env: &'a [String],
    /// Arm `PTRACE_TRACEME` before exec.
    pub trace: bool,
    /// Where `log`-console output lands.
    pub log_path: PathBuf,
    /// Degrade the `log` console policy to `none` (`--no-log`).
    pub no_log: bool,
    /// Chroot inherited from the class's session, applied before the
    /// job-level chroot.
    pub session_chroot: Option<&'a str>,
    /// Restore sane termios on the console after opening it.
    pub reset_console: bool,
    /// Running as the system init: default the working directory to `/`.
    pub system_mode: bool,
}

/// A successfully forked (not yet necessarily exec'd) process.
pub struct SpawnOutcome {
    /// The child pid.
    pub pid: i32,
    /// Read side of the error pipe; closure without data means success.
    pub error_fd: RawFd,
    /// Write side of the script-feeder pipe, when the body is drip-fed.
    pub shell_fd: Option<RawFd>,
    /// Script bytes to feed once setup completes.
    pub script: Option<Vec<u8>>,
    /// Log attached to the pty master for `log`-console spawns.
    pub log: Option<Log>,
}

/// Encodes one wire error record.
pub fn encode_error(kind: SpawnErrorKind, arg: u32, errno: i32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&(kind as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&arg.to_le_bytes());
    buf[8..12].copy_from_slice(&errno.to_le_bytes());
    buf
}

/// Decodes a wire error record read from the error pipe.
pub fn decode_error(buf: &[u8]) -> Option<SpawnError> {
    if buf.len() < 12 {
        return None;
    }
    let kind = u32::from_le_bytes(buf[0..4].try_into().ok()?);
    let arg = u32::from_le_bytes(buf[4..8].try_into().ok()?);
    let errno = i32::from_le_bytes(buf[8..12].try_into().ok()?);
    Some(SpawnError {
        kind: SpawnErrorKind::from_wire(kind)?,
        arg,
        errno: Errno::from_raw(errno),
    })
}

/// What a readable error pipe had to say.
#[derive(Debug, PartialEq, Eq)]
pub enum ErrorPipeEvent {
    /// Nothing yet; keep watching.
    Pending,
    /// Pipe closed without data: setup succeeded and `exec` ran.
    Success,
    /// Structured setup failure.
    Failed(SpawnError),
}

/// Drains one readiness notification on an error pipe.
pub fn read_error_pipe(fd: RawFd) -> ErrorPipeEvent {
    let mut buf = [0u8; 12];
    match unistd::read(fd, &mut buf) {
        Ok(0) => ErrorPipeEvent::Success,
        Ok(n) => match decode_error(&buf[..n]) {
            Some(err) => ErrorPipeEvent::Failed(err),
            // Short or garbled record; treat as an exec failure so the
            // state machine still observes a failed setup.
            None => ErrorPipeEvent::Failed(SpawnError {
                kind: SpawnErrorKind::Exec,
                arg: 0,
                errno: Errno::EIO,
            }),
        },
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => ErrorPipeEvent::Pending,
        Err(_) => ErrorPipeEvent::Success,
    }
}

/// Streams a drip-fed script to the shell, prefixed with the line that
/// closes the reserved descriptor inside the shell, then closes the pipe.
pub fn feed_script(shell_fd: RawFd, script: &[u8]) -> io::Result<()> {
    let mut file = unsafe {
        use std::os::unix::io::FromRawFd;
        std::fs::File::from_raw_fd(shell_fd)
    };
    file.write_all(format!("exec {SCRIPT_FD}<&-\n").as_bytes())?;
    file.write_all(script)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn cstring(text: &str) -> CString {
    // NUL bytes cannot appear in tokenized configuration text; map them to
    // an empty string rather than panic.
    CString::new(text).unwrap_or_default()
}

fn pipe_cloexec() -> nix::Result<(RawFd, RawFd)> {
    use std::os::unix::io::IntoRawFd;
    let (read_end, write_end) =
        unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
    Ok((read_end.into_raw_fd(), write_end.into_raw_fd()))
}

fn set_nonblock(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// Forks and sets up one job process.
///
/// Transient `fork` failures are retried indefinitely with a warning; the
/// returned outcome therefore always carries a live pid. Setup failures
/// arrive later through the error pipe.
pub fn spawn(req: &SpawnRequest<'_>) -> Result<SpawnOutcome, SpawnError> {
    let spec = req
        .class
        .process(req.role)
        .expect("spawn caller checked the role is defined");

    let console = if req.no_log && req.class.console == ConsoleType::Log {
        ConsoleType::None
    } else {
        req.class.console
    };

    // Assemble argv/envp before forking; the child must not allocate for
    // them.
    let interpretation = spec.interpretation();
    let script = match &interpretation {
        Interpretation::ShellScript(body) => Some(body.clone().into_bytes()),
        _ => None,
    };
    let argv: Vec<CString> = spec
        .argv(script.as_ref().map(|_| SCRIPT_FD))
        .iter()
        .map(|arg| cstring(arg))
        .collect();
    let mut argv_ptrs: Vec<*const libc::c_char> =
        argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let envp: Vec<CString> = req.env.iter().map(|entry| cstring(entry)).collect();
    let mut envp_ptrs: Vec<*const libc::c_char> =
        envp.iter().map(|entry| entry.as_ptr()).collect();
    envp_ptrs.push(std::ptr::null());

    // The security profile is expanded against the job environment in the
    // parent; the child only writes it out.
    let apparmor_profile = match (&req.class.apparmor, req.role) {
        (Some(policy), ProcessRole::Main) => {
            let profile = match policy {
                ApparmorPolicy::Load(path) => path.as_str(),
                ApparmorPolicy::Switch(profile) => profile.as_str(),
            };
            let expanded =
                environ::expand(profile, req.env).unwrap_or_else(|_| profile.to_string());
            Some(cstring(&format!("exec {expanded}\n")))
        }
        _ => None,
    };

    let pty_master: Option<RawFd> = if console == ConsoleType::Log {
        let master = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
        if master < 0 {
            return Err(SpawnError {
                kind: SpawnErrorKind::OpenptSlave,
                arg: 0,
                errno: Errno::last(),
            });
        }
        Some(master)
    } else {
        None
    };

    let script_pipe = if script.is_some() {
        match pipe_cloexec() {
            Ok(pair) => Some(pair),
            Err(errno) => {
                close_optional(pty_master);
                return Err(SpawnError {
                    kind: SpawnErrorKind::Dup,
                    arg: 0,
                    errno,
                });
            }
        }
    } else {
        None
    };

    let (error_read, error_write) = match pipe_cloexec() {
        Ok(pair) => pair,
        Err(errno) => {
            close_optional(pty_master);
            if let Some((r, w)) = script_pipe {
                close_optional(Some(r));
                close_optional(Some(w));
            }
            return Err(SpawnError {
                kind: SpawnErrorKind::Dup,
                arg: 0,
                errno,
            });
        }
    };

    let child = loop {
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { child }) => break child,
            Ok(ForkResult::Child) => {
                child_setup(
                    req,
                    console,
                    &argv_ptrs,
                    &envp_ptrs,
                    error_read,
                    error_write,
                    script_pipe.map(|(read_end, _)| read_end),
                    pty_master,
                    apparmor_profile.as_deref(),
                );
            }
            Err(errno) => {
                // EAGAIN and kin are transient; an init daemon has nothing
                // better to do than keep trying.
                warn!(
                    job = %req.class.name,
                    role = %req.role,
                    "fork failed ({errno}), retrying"
                );
                std::thread::sleep(FORK_RETRY_DELAY);
            }
        }
    };

    // Parent: drop the child-side descriptors.
    close_optional(Some(error_write));
    let shell_fd = script_pipe.map(|(read_end, write_end)| {
        close_optional(Some(read_end));
        write_end
    });
    set_nonblock(error_read);

    let log = pty_master.map(|master| {
        set_nonblock(master);
        Log::new(req.log_path.clone(), master)
    });

    Ok(SpawnOutcome {
        pid: child.as_raw(),
        error_fd: error_read,
        shell_fd,
        script,
        log,
    })
}

fn close_optional(fd: Option<RawFd>) {
    if let Some(fd) = fd {
        unsafe { libc::close(fd) };
    }
}

fn abort_child(error_fd: RawFd, kind: SpawnErrorKind, arg: u32) -> ! {
    let record = encode_error(kind, arg, Errno::last() as i32);
    unsafe {
        libc::write(error_fd, record.as_ptr() as *const libc::c_void, record.len());
        libc::_exit(255);
    }
}

/// Moves `fd` above the reserved script descriptor if it collides,
/// keeping close-on-exec.
fn clear_of_script_fd(error_fd: RawFd, fd: RawFd) -> RawFd {
    if fd != SCRIPT_FD {
        return fd;
    }
    let moved = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, SCRIPT_FD + 1) };
    if moved < 0 {
        abort_child(error_fd, SpawnErrorKind::Dup, 0);
    }
    unsafe { libc::close(fd) };
    moved
}

#[allow(clippy::too_many_arguments)]
fn child_setup(
    req: &SpawnRequest<'_>,
    console: ConsoleType,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    error_read: RawFd,
    error_write: RawFd,
    script_read: Option<RawFd>,
    pty_master: Option<RawFd>,
    apparmor_profile: Option<&std::ffi::CStr>,
) -> ! {
    unsafe { libc::close(error_read) };
    let error_fd = clear_of_script_fd(error_write, error_write);

    // Allocate and open the pty slave while the master is still open.
    let pty_slave: Option<RawFd> = pty_master.map(|master| {
        let master = clear_of_script_fd(error_fd, master);
        unsafe {
            if libc::grantpt(master) < 0 {
                abort_child(error_fd, SpawnErrorKind::Grantpt, 0);
            }
            if libc::unlockpt(master) < 0 {
                abort_child(error_fd, SpawnErrorKind::Unlockpt, 0);
            }
            let mut name = [0u8; 64];
            if libc::ptsname_r(master, name.as_mut_ptr() as *mut libc::c_char, name.len())
                != 0
            {
                abort_child(error_fd, SpawnErrorKind::Ptsname, 0);
            }
            let slave = libc::open(
                name.as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_NOCTTY,
            );
            if slave < 0 {
                abort_child(error_fd, SpawnErrorKind::OpenptSlave, 0);
            }
            libc::close(master);
            slave
        }
    });

    // Park the script body on its reserved descriptor.
    if let Some(read_end) = script_read {
        if read_end != SCRIPT_FD {
            if unsafe { libc::dup2(read_end, SCRIPT_FD) } < 0 {
                abort_child(error_fd, SpawnErrorKind::Dup, 0);
            }
            unsafe { libc::close(read_end) };
        } else {
            // dup2 onto itself would keep close-on-exec; clear it.
            let flags = unsafe { libc::fcntl(read_end, libc::F_GETFD) };
            unsafe {
                libc::fcntl(read_end, libc::F_SETFD, flags & !libc::FD_CLOEXEC)
            };
        }
    }

    // Become session and process-group leader.
    unsafe { libc::setsid() };

    setup_console(req, console, pty_slave, error_fd);

    if let Some(profile) = apparmor_profile {
        write_attr_exec(profile, error_fd);
    }

    if req.role != ProcessRole::Security {
        apply_resources(req, error_fd);
        apply_identity(req, error_fd);
    }

    // Restore default dispositions and unblock everything the daemon
    // keeps masked.
    unsafe {
        for signo in 1..libc::SIGRTMAX() {
            if signo == libc::SIGKILL || signo == libc::SIGSTOP {
                continue;
            }
            libc::signal(signo, libc::SIG_DFL);
        }
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        if libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut()) != 0 {
            abort_child(error_fd, SpawnErrorKind::Signal, 0);
        }
    }

    if req.trace && nix::sys::ptrace::traceme().is_err() {
        abort_child(error_fd, SpawnErrorKind::Ptrace, 0);
    }

    unsafe {
        libc::execvpe(argv[0], argv.as_ptr(), envp.as_ptr());
    }
    abort_child(error_fd, SpawnErrorKind::Exec, 0);
}

fn setup_console(
    req: &SpawnRequest<'_>,
    console: ConsoleType,
    pty_slave: Option<RawFd>,
    error_fd: RawFd,
) {
    // Fixed C literals: the child must not touch the allocator here.
    let dev_null = c"/dev/null";
    let dev_console = c"/dev/console";

    unsafe {
        match console {
            ConsoleType::None => {
                let fd = libc::open(dev_null.as_ptr(), libc::O_RDWR);
                if fd < 0 {
                    abort_child(error_fd, SpawnErrorKind::Console, 0);
                }
                dup_std(fd, error_fd);
            }
            ConsoleType::Output | ConsoleType::Owner => {
                let fd = libc::open(dev_console.as_ptr(), libc::O_RDWR | libc::O_NOCTTY);
                if fd < 0 {
                    abort_child(error_fd, SpawnErrorKind::Console, 0);
                }
                if console == ConsoleType::Owner
                    && libc::ioctl(fd, libc::TIOCSCTTY, 1) < 0
                {
                    abort_child(error_fd, SpawnErrorKind::Console, 0);
                }
                if req.reset_console {
                    sane_termios(fd);
                }
                dup_std(fd, error_fd);
            }
            ConsoleType::Log => {
                let stdin_fd = libc::open(dev_null.as_ptr(), libc::O_RDWR);
                if stdin_fd < 0 {
                    abort_child(error_fd, SpawnErrorKind::Console, 0);
                }
                if libc::dup2(stdin_fd, libc::STDIN_FILENO) < 0 {
                    abort_child(error_fd, SpawnErrorKind::Dup, 0);
                }
                if stdin_fd > libc::STDERR_FILENO {
                    libc::close(stdin_fd);
                }
                let slave = pty_slave.expect("log console allocated a pty");
                if libc::dup2(slave, libc::STDOUT_FILENO) < 0
                    || libc::dup2(slave, libc::STDERR_FILENO) < 0
                {
                    abort_child(error_fd, SpawnErrorKind::Dup, 0);
                }
                if slave > libc::STDERR_FILENO {
                    libc::close(slave);
                }
            }
        }
    }
}

unsafe fn dup_std(fd: RawFd, error_fd: RawFd) {
    unsafe {
        if libc::dup2(fd, libc::STDIN_FILENO) < 0
            || libc::dup2(fd, libc::STDOUT_FILENO) < 0
            || libc::dup2(fd, libc::STDERR_FILENO) < 0
        {
            abort_child(error_fd, SpawnErrorKind::Dup, 0);
        }
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }
}

fn sane_termios(fd: RawFd) {
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tio) != 0 {
            return;
        }
        tio.c_iflag |= libc::ICRNL | libc::IXON;
        tio.c_oflag |= libc::OPOST | libc::ONLCR;
        tio.c_lflag |= libc::ICANON | libc::ECHO | libc::ECHOE | libc::ECHOK | libc::ISIG;
        libc::tcsetattr(fd, libc::TCSANOW, &tio);
    }
}

fn write_attr_exec(profile: &std::ffi::CStr, error_fd: RawFd) {
    unsafe {
        let path = c"/proc/self/attr/exec";
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY);
        if fd < 0 {
            abort_child(error_fd, SpawnErrorKind::Security, 0);
        }
        let bytes = profile.to_bytes();
        let written = libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
        libc::close(fd);
        if written != bytes.len() as isize {
            abort_child(error_fd, SpawnErrorKind::Security, 0);
        }
    }
}

fn apply_resources(req: &SpawnRequest<'_>, error_fd: RawFd) {
    for (resource, limit) in &req.class.limits {
        if nix::sys::resource::setrlimit(
            resource.to_resource(),
            limit.soft.to_rlim(),
            limit.hard.to_rlim(),
        )
        .is_err()
        {
            abort_child(error_fd, SpawnErrorKind::Rlimit, *resource as u32);
        }
    }

    unsafe { libc::umask(req.class.umask as libc::mode_t) };

    if let Some(nice) = req.class.nice {
        if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) } != 0 {
            abort_child(error_fd, SpawnErrorKind::Priority, 0);
        }
    }

    if let Some(score) = req.class.oom_score_adj {
        write_oom_adjust(score, error_fd);
    }
}

fn write_oom_adjust(score: i32, error_fd: RawFd) {
    unsafe {
        let path = c"/proc/self/oom_score_adj";
        let mut fd = libc::open(path.as_ptr(), libc::O_WRONLY);
        let mut value = score;
        if fd < 0 && Errno::last() == Errno::ENOENT {
            // Pre-oom_score_adj kernel: fall back to the legacy range.
            let legacy = c"/proc/self/oom_adj";
            fd = libc::open(legacy.as_ptr(), libc::O_WRONLY);
            value = if score < 0 {
                score * 17 / 1000
            } else {
                score * 15 / 1000
            };
        }
        if fd < 0 {
            abort_child(error_fd, SpawnErrorKind::OomAdj, 0);
        }
        let mut text = [0u8; 12];
        let formatted = format_i32(value, &mut text);
        let written = libc::write(
            fd,
            formatted.as_ptr() as *const libc::c_void,
            formatted.len(),
        );
        libc::close(fd);
        if written != formatted.len() as isize {
            abort_child(error_fd, SpawnErrorKind::OomAdj, 0);
        }
    }
}

/// Formats an i32 into a stack buffer; the child avoids the allocator.
fn format_i32(value: i32, buf: &mut [u8; 12]) -> &[u8] {
    let mut n = value.unsigned_abs();
    let mut idx = buf.len();
    loop {
        idx -= 1;
        buf[idx] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    if value < 0 {
        idx -= 1;
        buf[idx] = b'-';
    }
    &buf[idx..]
}

fn apply_identity(req: &SpawnRequest<'_>, error_fd: RawFd) {
    // Chroot: session first, then the job's own.
    for root in [req.session_chroot, req.class.chroot.as_deref()]
        .into_iter()
        .flatten()
    {
        let path = cstring(root);
        if unsafe { libc::chroot(path.as_ptr()) } != 0 {
            abort_child(error_fd, SpawnErrorKind::Chroot, 0);
        }
        if unsafe { libc::chdir(c"/".as_ptr()) } != 0 {
            abort_child(error_fd, SpawnErrorKind::Chdir, 0);
        }
    }

    match (&req.class.chdir, req.system_mode) {
        (Some(dir), _) => {
            let path = cstring(dir);
            if unsafe { libc::chdir(path.as_ptr()) } != 0 {
                abort_child(error_fd, SpawnErrorKind::Chdir, 0);
            }
        }
        (None, true) => {
            if unsafe { libc::chdir(c"/".as_ptr()) } != 0 {
                abort_child(error_fd, SpawnErrorKind::Chdir, 0);
            }
        }
        (None, false) => {}
    }

    // Resolve names to ids before any id actually changes.
    let mut gid: Option<Gid> = None;
    let mut uid: Option<(Uid, CString)> = None;

    if let Some(group_name) = &req.class.setgid {
        match Group::from_name(group_name) {
            Ok(Some(group)) => gid = Some(group.gid),
            Ok(None) => abort_child(error_fd, SpawnErrorKind::BadSetgid, 0),
            Err(_) => abort_child(error_fd, SpawnErrorKind::Getgrnam, 0),
        }
    }

    if let Some(user_name) = &req.class.setuid {
        match User::from_name(user_name) {
            Ok(Some(user)) => {
                if gid.is_none() {
                    gid = Some(user.gid);
                }
                uid = Some((user.uid, cstring(user_name)));
            }
            Ok(None) => abort_child(error_fd, SpawnErrorKind::BadSetuid, 0),
            Err(_) => abort_child(error_fd, SpawnErrorKind::Getpwnam, 0),
        }
    }

    if let (Some((_, user_name)), Some(group)) = (&uid, gid) {
        if Uid::effective().is_root()
            && unsafe { libc::initgroups(user_name.as_ptr(), group.as_raw() as _) } != 0
        {
            abort_child(error_fd, SpawnErrorKind::Initgroups, 0);
        }
    }

    join_cgroups(req, error_fd);

    if let Some(group) = gid {
        if unsafe { libc::setgid(group.as_raw()) } != 0 {
            abort_child(error_fd, SpawnErrorKind::Setgid, 0);
        }
    }
    if let Some((user, _)) = uid {
        if unsafe { libc::setuid(user.as_raw()) } != 0 {
            abort_child(error_fd, SpawnErrorKind::Setuid, 0);
        }
    }
}

fn join_cgroups(req: &SpawnRequest<'_>, error_fd: RawFd) {
    use std::path::Path;

    for cgroup in &req.class.cgroups {
        let base = Path::new("/sys/fs/cgroup").join(&cgroup.controller);
        if !base.exists() {
            abort_child(error_fd, SpawnErrorKind::CgroupMgrConnect, 0);
        }

        let name = cgroup.name.as_deref().unwrap_or(&req.class.name);
        let dir = base.join(name.replace('/', "_"));
        if std::fs::create_dir_all(&dir).is_err() {
            abort_child(error_fd, SpawnErrorKind::CgroupSetup, 0);
        }
        for (key, value) in &cgroup.settings {
            if std::fs::write(dir.join(key), value).is_err() {
                abort_child(error_fd, SpawnErrorKind::CgroupSetup, 0);
            }
        }
        // Writing 0 moves the calling process.
        if std::fs::write(dir.join("cgroup.procs"), "0").is_err() {
            abort_child(error_fd, SpawnErrorKind::CgroupEnter, 0);
        }
    }
}
