//! PawScript Runtime: substitution, command dispatch, tokens, macros, and
//! fiber scheduling built on top of `pawscript-core`.
//!
//! # Modules
//!
//! - `command`: command/connector parsing (`;`, `&`, `|`)
//! - `splitter`: quote/paren-aware top-level scanning shared by `command`
//!   and `substitution`
//! - `substitution`: the three-phase substitution engine (C4)
//! - `template`: opportunistic argument-template classification (§4.4)
//! - `token`: completion tokens and brace coordinators (C6)
//! - `executor`: command dispatch and sequence execution (C5)
//! - `macros`: user-defined macro runtime (C7)
//! - `fiber`: cooperative fiber scheduler (C8)
//! - `config`: `ExecutorConfig`/`WatchdogConfig`
//! - `logger`: the `Logger` trait and its stderr default
//! - `diagnostics`: SIGQUIT dump handler and fiber watchdog (§6 ADD)

pub mod command;
pub mod config;
pub mod diagnostics;
pub mod executor;
pub mod fiber;
pub mod logger;
pub mod macros;
pub mod splitter;
pub mod substitution;
pub mod template;
pub mod token;

pub use command::{CommandInvocation, CommandSequence, Connector};
pub use config::{ExecutorConfig, OptimizationLevel, WatchdogAction, WatchdogConfig};
pub use diagnostics::{install_signal_handler, install_watchdog, DiagnosticsReport};
pub use executor::{Context, Executor, Handler, HandlerOutcome};
pub use fiber::{FiberId, FiberOutcome, FiberState, FiberTable};
pub use logger::{LogLevel, Logger, StderrLogger};
pub use macros::{execute_macro, MacroContext, MacroDef, MacroHandler};
pub use splitter::{find_top_level_braces, split_sequence, split_top_level, BraceSpan};
pub use substitution::{literal_value, substitute, MacroSubstContext, QuoteContext, SubstResult};
pub use template::{ArgTemplateCache, Segment};
pub use token::{CleanupFn, ContinuationFn, TokenId, TokenTable};
