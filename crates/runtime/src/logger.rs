//! The `Context::log_*` family routes through a small [`Logger`] trait
//! rather than a logging façade crate: the teacher's runtime crate writes
//! structured text straight to stderr in `diagnostics.rs`/`watchdog.rs` and
//! never pulls in `tracing` (that only shows up in the teacher's LSP
//! binary, an external collaborator here). Embedders can supply their own
//! `Logger` to route into their own facility.

use pawscript_core::Position;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, position: Option<Position>, message: &str);
}

/// Default embedding: write to stderr, matching the teacher's
/// `dump_diagnostics`/watchdog output style (plain lines, no structured
/// log crate).
#[derive(Debug, Default)]
pub struct StderrLogger;

impl Logger for StderrLogger {
    fn log(&self, level: LogLevel, position: Option<Position>, message: &str) {
        match position {
            Some(pos) => eprintln!("[{level}] {pos}: {message}"),
            None => eprintln!("[{level}] {message}"),
        }
    }
}
