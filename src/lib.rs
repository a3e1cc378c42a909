//! An event-driven process supervision daemon for Unix hosts.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binaries (src/bin/)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Job definition files.
pub mod config;

/// Control socket protocol.
pub mod control;

/// KEY=VALUE environment arrays.
pub mod environ;

/// Errors.
pub mod error;

/// Event queue and retention.
pub mod event;

/// Expression parser.
pub mod expr;

/// Job instances and their state machine.
pub mod job;

/// Job classes and the registry.
pub mod job_class;

/// Per-job output logs.
pub mod log;

/// Event expression trees.
pub mod operator;

/// Constants and well-known paths.
pub mod paths;

/// Process definitions.
pub mod process;

/// Child reaping and ptrace dispatch.
pub mod reaper;

/// The daemon runtime and main loop.
pub mod runtime;

/// Process spawning.
pub mod spawn;

/// Stateful re-exec.
pub mod state;
