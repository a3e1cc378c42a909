//! Command-line interface for the emberd daemon.
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::job_class::ConsoleType;
use crate::runtime::Options;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", ...) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for the emberd daemon.
#[derive(Parser, Debug)]
#[command(name = "emberd", version, author)]
#[command(about = "An event-driven process supervision daemon", long_about = None)]
pub struct Cli {
    /// Additional directory to search for job definitions (repeatable;
    /// replaces the defaults when given).
    #[arg(long = "confdir", value_name = "DIR")]
    pub confdir: Vec<PathBuf>,

    /// Directory to write per-job logs under.
    #[arg(long = "logdir", value_name = "DIR")]
    pub logdir: Option<PathBuf>,

    /// Console policy for jobs without a `console` stanza.
    #[arg(long = "default-console", value_name = "POLICY")]
    pub default_console: Option<ConsoleType>,

    /// Disable the job log writer.
    #[arg(long = "no-log")]
    pub no_log: bool,

    /// Ignore session bindings on job classes.
    #[arg(long = "no-sessions")]
    pub no_sessions: bool,

    /// Do not emit an event at boot.
    #[arg(long = "no-startup-event")]
    pub no_startup_event: bool,

    /// Name of the event emitted at boot.
    #[arg(long = "startup-event", value_name = "NAME")]
    pub startup_event: Option<String>,

    /// Run as a per-user service manager (XDG paths).
    #[arg(long = "user")]
    pub user: bool,

    /// Run as a per-session service manager (implies --user).
    #[arg(long = "session")]
    pub session: bool,

    /// This invocation is a re-exec of a previous daemon.
    #[arg(long = "restart")]
    pub restart: bool,

    /// File descriptor to read serialised state from on re-exec.
    #[arg(long = "state-fd", value_name = "FD")]
    pub state_fd: Option<i32>,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<LogLevelArg>,
}

impl Cli {
    /// Resolves the parsed flags into runtime options.
    pub fn to_options(&self) -> Options {
        let mut opts = if self.user || self.session {
            Options::user()
        } else {
            Options::system()
        };

        if !self.confdir.is_empty() {
            opts.confdirs = self.confdir.clone();
        }
        if let Some(logdir) = &self.logdir {
            opts.logdir = logdir.clone();
        }
        if let Some(console) = self.default_console {
            opts.default_console = console;
        }
        opts.no_log = self.no_log;
        opts.no_sessions = self.no_sessions;
        opts.no_startup_event = self.no_startup_event;
        if let Some(event) = &self.startup_event {
            opts.startup_event = event.clone();
        }
        opts.restart = self.restart;
        opts.state_fd = self.state_fd;
        opts
    }
}

/// Parses command-line arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeMode;

    #[test]
    fn defaults_resolve_to_system_mode() {
        let cli = Cli::parse_from(["emberd"]);
        let opts = cli.to_options();
        assert_eq!(opts.mode, RuntimeMode::System);
        assert!(!opts.restart);
        assert_eq!(opts.startup_event, "startup");
    }

    #[test]
    fn confdirs_are_repeatable() {
        let cli = Cli::parse_from([
            "emberd", "--confdir", "/a", "--confdir", "/b", "--user",
        ]);
        let opts = cli.to_options();
        assert_eq!(opts.mode, RuntimeMode::User);
        assert_eq!(
            opts.confdirs,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn restart_carries_the_state_descriptor() {
        let cli = Cli::parse_from(["emberd", "--restart", "--state-fd", "7"]);
        let opts = cli.to_options();
        assert!(opts.restart);
        assert_eq!(opts.state_fd, Some(7));
    }

    #[test]
    fn startup_event_can_be_renamed_or_suppressed() {
        let cli = Cli::parse_from(["emberd", "--startup-event", "boot"]);
        assert_eq!(cli.to_options().startup_event, "boot");

        let cli = Cli::parse_from(["emberd", "--no-startup-event"]);
        assert!(cli.to_options().no_startup_event);
    }

    #[test]
    fn log_levels_parse_names_and_numbers() {
        assert_eq!("info".parse::<LogLevelArg>().unwrap().as_str(), "info");
        assert_eq!("4".parse::<LogLevelArg>().unwrap().as_str(), "debug");
        assert!("verbose".parse::<LogLevelArg>().is_err());
    }
}
