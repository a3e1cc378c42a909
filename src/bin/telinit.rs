//! SysV-compatibility runlevel shim.
//!
//! Validates that the caller is root and asks the resident daemon to emit
//! a `runlevel` event carrying the requested level. Anything outside the
//! known set is a silent no-op, and the historic `-t`/`-e` options are
//! accepted and ignored.

use std::process::ExitCode;

use clap::Parser;
use nix::unistd::{Uid, setuid};

use emberd::control::{self, ControlCommand};
use emberd::paths::RUNLEVEL_EVENT;
use emberd::runtime::{RuntimeMode, runtime_dir};

/// Change runlevel.
#[derive(Parser, Debug)]
#[command(name = "ember-telinit", version)]
#[command(about = "Change runlevel", long_about = None)]
struct Cli {
    /// RUNLEVEL should be one of 0123456S.
    runlevel: String,

    /// Seconds to wait for processes to die (ignored, for compatibility).
    #[arg(short = 't', value_name = "SECONDS")]
    wait: Option<u64>,

    /// Environment to set (ignored, for compatibility).
    #[arg(short = 'e', value_name = "VAR=VAL")]
    env: Vec<String>,
}

const RUNLEVELS: &str = "0123456SsQqabcUu";

fn main() -> ExitCode {
    let args = Cli::parse();

    // Check we're root.
    let _ = setuid(Uid::effective());
    if !Uid::current().is_root() {
        eprintln!("ember-telinit: need to be root");
        return ExitCode::from(1);
    }

    let mut chars = args.runlevel.chars();
    let level = match (chars.next(), chars.next()) {
        (Some(level), None) if RUNLEVELS.contains(level) => level,
        // Anything else is deliberately a no-op.
        _ => return ExitCode::SUCCESS,
    };

    let command = ControlCommand::EmitEvent {
        name: RUNLEVEL_EVENT.to_string(),
        env: vec![format!("RUNLEVEL={level}")],
        wait: false,
    };

    match control::send_command(&runtime_dir(RuntimeMode::System), &command) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ember-telinit: {err}");
            ExitCode::from(1)
        }
    }
}
