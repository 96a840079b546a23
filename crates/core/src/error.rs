//! Error kinds raised by the execution core (spec §7).
//!
//! Mirrors the teacher's hand-written `Display`/`std::error::Error` idiom
//! (`codegen/error.rs`) rather than pulling in an error-derive crate: the
//! teacher's whole workspace never depends on `thiserror` or `anyhow`, so
//! neither do we.
//!
//! `PawError` never crosses a handler boundary as a `Result` — per §7 the
//! core "does not throw across handler boundaries"; every failure becomes
//! a logged `PawError` plus a synchronous `BoolStatus(false)`. This type
//! exists so the internal plumbing (substitution, executor, token system)
//! has one vocabulary for that logging, and so tests can assert on kind.

use crate::position::Position;

/// One of the error kinds enumerated in spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    UnknownCommand,
    Argument,
    Type,
    Reference,
    Math,
    Flow,
    Macro,
    Token,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "ParseError",
            ErrorKind::UnknownCommand => "UnknownCommand",
            ErrorKind::Argument => "ArgumentError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Reference => "ReferenceError",
            ErrorKind::Math => "MathError",
            ErrorKind::Flow => "FlowError",
            ErrorKind::Macro => "MacroError",
            ErrorKind::Token => "TokenError",
        }
    }
}

/// A diagnostic raised by the core, carrying its kind, message, and the
/// source position it occurred at (if known).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PawError {
    pub kind: ErrorKind,
    pub message: String,
    pub position: Option<Position>,
    /// The enclosing macro call chain, innermost first, formatted by the
    /// runtime crate's `MacroContext::format_chain` (§7 "errors are logged
    /// with position and the macro call chain"). `None` for an error
    /// raised outside any macro invocation.
    pub call_chain: Option<String>,
}

impl PawError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            position: None,
            call_chain: None,
        }
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    /// Attach the macro call chain this error occurred under (§7
    /// Propagation). A no-op when `chain` is empty, since a root-level
    /// error has no chain to report.
    pub fn with_call_chain(mut self, chain: impl Into<String>) -> Self {
        let chain = chain.into();
        if !chain.is_empty() {
            self.call_chain = Some(chain);
        }
        self
    }

    pub fn unknown_command(name: &str, position: Position) -> Self {
        Self::new(ErrorKind::UnknownCommand, format!("unknown command '{name}'")).at(position)
    }

    pub fn reference(name: &str, position: Position) -> Self {
        Self::new(
            ErrorKind::Reference,
            format!("no such variable or object '{name}'"),
        )
        .at(position)
    }

    pub fn argument(message: impl Into<String>, position: Position) -> Self {
        Self::new(ErrorKind::Argument, message).at(position)
    }

    pub fn flow(message: impl Into<String>, position: Position) -> Self {
        Self::new(ErrorKind::Flow, message).at(position)
    }

    pub fn token(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Token, message)
    }

    pub fn macro_err(message: impl Into<String>, position: Position) -> Self {
        Self::new(ErrorKind::Macro, message).at(position)
    }
}

impl std::fmt::Display for PawError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.position {
            Some(pos) => write!(f, "{} at {}: {}", self.kind.as_str(), pos, self.message)?,
            None => write!(f, "{}: {}", self.kind.as_str(), self.message)?,
        }
        if let Some(chain) = &self.call_chain {
            write!(f, " (called from: {chain})")?;
        }
        Ok(())
    }
}

impl std::error::Error for PawError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_position_when_present() {
        let err = PawError::unknown_command("frobnicate", Position::new(3, 7));
        assert_eq!(
            err.to_string(),
            "UnknownCommand at 3:7: unknown command 'frobnicate'"
        );
    }

    #[test]
    fn display_omits_position_when_absent() {
        let err = PawError::token("resume on closed token 9");
        assert_eq!(err.to_string(), "TokenError: resume on closed token 9");
    }

    #[test]
    fn display_appends_call_chain_when_present() {
        let err = PawError::macro_err("exceeded maximum nesting depth", Position::new(4, 2))
            .with_call_chain("inner (defined at 2:1, invoked at 4:2) <- outer (defined at 1:1, invoked at 1:1)");
        assert_eq!(
            err.to_string(),
            "MacroError at 4:2: exceeded maximum nesting depth (called from: inner (defined at 2:1, invoked at 4:2) <- outer (defined at 1:1, invoked at 1:1))"
        );
    }

    #[test]
    fn with_call_chain_is_noop_for_empty_chain() {
        let err = PawError::token("resume on closed token 9").with_call_chain("");
        assert_eq!(err.to_string(), "TokenError: resume on closed token 9");
    }
}
