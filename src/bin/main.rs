use std::fs;
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use emberd::cli::{Cli, parse_args};
use emberd::runtime::{Daemon, ExitReason, RuntimeMode, runtime_dir};

fn main() -> ExitCode {
    let args = parse_args();
    let opts = args.to_options();

    init_logging(&args, opts.mode);

    info!(
        mode = ?opts.mode,
        restart = opts.restart,
        "emberd starting"
    );

    let mut daemon = match Daemon::new(opts) {
        Ok(daemon) => daemon,
        Err(err) => {
            error!("fatal startup failure: {err}");
            return ExitCode::from(1);
        }
    };

    match daemon.run() {
        ExitReason::Shutdown => {
            info!("emberd shut down cleanly");
            ExitCode::SUCCESS
        }
    }
}

fn init_logging(args: &Cli, mode: RuntimeMode) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // The daemon's own log lives beside the runtime state; job output has
    // its own per-job files.
    let log_dir = runtime_dir(mode);
    if let Err(err) = fs::create_dir_all(&log_dir) {
        eprintln!("Failed to create runtime directory {log_dir:?}: {err}");
    }
    let log_path = log_dir.join("daemon.log");

    let file = match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => file,
        Err(err) => {
            eprintln!("Failed to open daemon log file {log_path:?}: {err}");
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            return;
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || file.try_clone().expect("clone log handle"))
        .with_ansi(false)
        .try_init();
}
