//! Per-job output logs.
//!
//! A job whose console policy is `log` gets its stdout/stderr attached to
//! a pty; the daemon drains the master side into an append-only file under
//! the log directory. The file is opened lazily on the first byte of
//! output so jobs that stay quiet never litter the log directory.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use chrono::Local;
use nix::errno::Errno;
use nix::unistd;
use tracing::warn;

use crate::paths::LOG_READ_BUFFER;

/// Computes `<logdir>/<class[.instance]>.log`, flattening any `/` in the
/// names so the file stays inside the log directory.
pub fn log_path(log_dir: &Path, class: &str, instance: &str) -> PathBuf {
    let mut name = class.replace('/', "_");
    if !instance.is_empty() {
        name.push('.');
        name.push_str(&instance.replace('/', "_"));
    }
    name.push_str(".log");
    log_dir.join(name)
}

/// One attached output stream: the master side of a job's pty and the
/// file it drains into.
#[derive(Debug)]
pub struct Log {
    /// Destination file path.
    pub path: PathBuf,
    /// Master descriptor being drained; `None` once the job side hung up.
    pub fd: Option<RawFd>,
    file: Option<File>,
    /// Bytes read before the file could be opened.
    backlog: Vec<u8>,
}

impl Log {
    /// Creates a log draining `fd` into `path`.
    pub fn new(path: PathBuf, fd: RawFd) -> Self {
        Self {
            path,
            fd: Some(fd),
            file: None,
            backlog: Vec::new(),
        }
    }

    fn open_file(&mut self) -> Option<&mut File> {
        if self.file.is_none() {
            match OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o640)
                .open(&self.path)
            {
                Ok(mut file) => {
                    if !self.backlog.is_empty() {
                        let backlog = std::mem::take(&mut self.backlog);
                        let _ = file.write_all(&backlog);
                    }
                    self.file = Some(file);
                }
                Err(err) => {
                    warn!(path = %self.path.display(), "cannot open job log: {err}");
                    return None;
                }
            }
        }
        self.file.as_mut()
    }

    /// Drains readable output into the file. Returns `false` once the
    /// stream is exhausted and the descriptor has been closed.
    pub fn drain(&mut self) -> bool {
        let Some(fd) = self.fd else {
            return false;
        };
        let mut buffer = [0u8; LOG_READ_BUFFER];
        loop {
            match unistd::read(fd, &mut buffer) {
                Ok(0) => {
                    self.close();
                    return false;
                }
                Ok(n) => {
                    let chunk = &buffer[..n];
                    match self.open_file() {
                        Some(file) => {
                            if let Err(err) = file.write_all(chunk) {
                                warn!(
                                    path = %self.path.display(),
                                    "job log write failed: {err}"
                                );
                            }
                        }
                        None => self.backlog.extend_from_slice(chunk),
                    }
                }
                Err(Errno::EAGAIN) => return true,
                Err(Errno::EINTR) => continue,
                // EIO is how a pty master reports the slave side closing.
                Err(Errno::EIO) => {
                    self.close();
                    return false;
                }
                Err(err) => {
                    warn!(path = %self.path.display(), "job log read failed: {err}");
                    self.close();
                    return false;
                }
            }
        }
    }

    /// Appends a daemon-side notice line (e.g. spawn failure) to the file.
    pub fn note(&mut self, message: &str) {
        if let Some(file) = self.open_file() {
            let stamp = Local::now().format("%Y-%m-%dT%H:%M:%S");
            let _ = writeln!(file, "[{stamp}] {message}");
        }
    }

    /// Closes the stream side, flushing nothing further.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            let _ = unistd::close(fd);
        }
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{FcntlArg, OFlag, fcntl};
    use nix::unistd::pipe;
    use std::os::fd::IntoRawFd;

    #[test]
    fn log_paths_flatten_slashes() {
        let dir = Path::new("/var/log/emberd");
        assert_eq!(
            log_path(dir, "tty", ""),
            PathBuf::from("/var/log/emberd/tty.log")
        );
        assert_eq!(
            log_path(dir, "net/device", "eth0"),
            PathBuf::from("/var/log/emberd/net_device.eth0.log")
        );
    }

    #[test]
    fn drain_appends_output_and_detects_eof() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (read_end, write_end) = pipe().expect("pipe");
        let read_fd = read_end.into_raw_fd();
        fcntl(read_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).expect("nonblock");

        let mut log = Log::new(dir.path().join("demo.log"), read_fd);
        unistd::write(&write_end, b"hello\n").expect("write");
        assert!(log.drain(), "stream still open");

        drop(write_end);
        assert!(!log.drain(), "eof closes the stream");
        assert!(log.fd.is_none());

        let contents = std::fs::read_to_string(dir.path().join("demo.log")).unwrap();
        assert_eq!(contents, "hello\n");
    }

    #[test]
    fn quiet_jobs_never_create_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (read_end, write_end) = pipe().expect("pipe");
        let read_fd = read_end.into_raw_fd();
        fcntl(read_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).expect("nonblock");

        let mut log = Log::new(dir.path().join("quiet.log"), read_fd);
        drop(write_end);
        assert!(!log.drain());
        assert!(!dir.path().join("quiet.log").exists());
    }
}
