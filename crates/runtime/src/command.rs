//! The shape of a parsed command (§1 "once a program has been parsed to a
//! tree of commands"). The source tokenizer/parser is an external
//! collaborator (§1/§6); this module only defines the narrow tree that C5
//! consumes and provides the minimal structural split (via
//! [`crate::splitter`]) needed to turn source text into that tree without
//! building a real grammar — connector/argument splitting, not parsing.

use crate::splitter::split_top_level;
use pawscript_core::Position;

/// The connector between two commands in a sequence (§4.5, §4.8 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// `;` — always run the next command.
    Semicolon,
    /// `&` — run the next command only if the previous succeeded.
    And,
    /// `|` — run the next command only if the previous failed.
    Or,
}

impl Connector {
    fn from_char(c: char) -> Option<Self> {
        match c {
            ';' => Some(Connector::Semicolon),
            '&' => Some(Connector::And),
            '|' => Some(Connector::Or),
            _ => None,
        }
    }

    /// Whether the next command should run given `status` (§8 "Sequence
    /// semantics").
    pub fn should_run_next(&self, status: bool) -> bool {
        match self {
            Connector::Semicolon => true,
            Connector::And => status,
            Connector::Or => !status,
        }
    }
}

/// One command invocation: a name and its comma-separated argument texts,
/// each still raw (unsubstituted) source text (§4.4 operates on these).
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub name: String,
    pub args: Vec<String>,
    pub position: Position,
}

/// A sequence of invocations joined by `;`/`&`/`|` (§4.5 step 5).
#[derive(Debug, Clone)]
pub struct CommandSequence {
    /// Each entry is a command paired with the connector that *follows*
    /// it (`None` for the last command).
    pub commands: Vec<(CommandInvocation, Option<Connector>)>,
}

impl CommandSequence {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Parse `text` into a [`CommandSequence`]. The name is everything up to
/// the first run of whitespace; the remainder is split on top-level
/// commas into argument texts (§4.4's comma-separated argument model).
/// `line` is the source line `text` starts on, used to seed `Position`s
/// relative to the enclosing command (braces pass their own content in
/// with the brace's line).
pub fn parse_sequence(text: &str, line: u32) -> CommandSequence {
    let mut commands = Vec::new();
    for (chunk, connector_char) in crate::splitter::split_sequence(text) {
        let trimmed = chunk.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (name, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((n, r)) => (n.to_string(), r.trim_start()),
            None => (trimmed.to_string(), ""),
        };
        let args = if rest.is_empty() {
            Vec::new()
        } else {
            split_top_level(rest, &[','])
                .into_iter()
                .map(|a| a.trim().to_string())
                .collect()
        };
        let connector = connector_char.and_then(Connector::from_char);
        commands.push((
            CommandInvocation {
                name,
                args,
                position: Position::new(line, 1),
            },
            connector,
        ));
    }
    CommandSequence { commands }
}
