//! Substitution engine (C4): quote-aware rewrite of command text.
//!
//! Three ordered phases, exactly as specified (§4.4):
//!
//! 1. escape protection — `\$`, and `\~`/`\?` at `paren_depth == 0`, are
//!    swapped for private placeholders so later phases don't reinterpret
//!    an escaped sigil.
//! 2. brace substitution — every top-level `{...}`/`${...}` is executed
//!    through the command executor (C5) and spliced back in, formatted
//!    according to the quote context of its position in the *original*
//!    text.
//! 3. dollar/tilde expansion — `$*`/`$@`/`$#`/`$N` and (inside double
//!    quotes only) `~name`/`?name`, active only when a macro context is
//!    in scope.
//!
//! Grounded on the teacher's continuation-passing dispatch style
//! (`executor.rs`): substitution never blocks a thread waiting for an
//! async brace, it hands the rest of the pipeline to a callback invoked
//! whenever the brace's command sequence (sync or suspended) completes —
//! the same discipline the teacher's `channel.rs` registry uses ("never
//! hold a lock across a call that might not return promptly").

use crate::executor::{Executor, HandlerOutcome};
use crate::splitter::{find_top_level_braces, BraceSpan};
use crate::token::TokenId;
use pawscript_core::{
    encode_marker, extract_refs, Frame, ObjectKind, ObjectRef, ObjectStore, Position, StoredPayload, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Whether a piece of text sits inside a double-quoted region (§4.4
/// phase 2/3: formatting and `~`/`?` both depend on this).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteContext {
    Outside,
    Inside,
}

/// Bound positional/named arguments for an active macro invocation (§4.4
/// phase 3, only active inside a macro body). Owned and cheaply
/// cloneable so it can be threaded through `'static` continuations
/// without borrowing the macro's frame.
#[derive(Clone)]
pub struct MacroSubstContext {
    pub args: Arc<Vec<Value>>,
    pub named: Arc<HashMap<String, Value>>,
    /// The object ref backing `$@` — a `List` already claimed by the
    /// macro's frame (§4.7 step 3).
    pub args_list: ObjectRef,
    /// Present when this macro body was parsed under
    /// `OptimizationLevel::Basic` (§6 "Parsed-command cache"). Consulted
    /// by [`crate::executor::Executor`] before falling back to the
    /// phase-based engine in this module.
    pub template_cache: Option<Arc<crate::template::ArgTemplateCache>>,
    /// This invocation's [`crate::macros::MacroContext`], threaded through
    /// dispatch so a nested `MacroHandler::call` can link its own
    /// `MacroContext` to its caller's (§4.7 step 1 "parent linkage for
    /// stack-trace formation"). `None` outside any macro body.
    pub call_chain: Option<Arc<crate::macros::MacroContext>>,
}

/// Three-way envelope a substitution completes with (§4.4 "The return
/// type of substitution is a three-way envelope").
pub type SubstResult = Result<String, ()>;

const DOLLAR_PLACEHOLDER: char = '\u{E000}';
const TILDE_PLACEHOLDER: char = '\u{E001}';
const QUESTION_PLACEHOLDER: char = '\u{E002}';

/// Phase 1: replace `\$` everywhere, and `\~`/`\?` only at top-level
/// (`paren_depth == 0`), with private placeholders.
fn protect_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut paren_depth: i32 = 0;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some('$') => {
                    out.push(DOLLAR_PLACEHOLDER);
                    chars.next();
                }
                Some('~') if paren_depth == 0 => {
                    out.push(TILDE_PLACEHOLDER);
                    chars.next();
                }
                Some('?') if paren_depth == 0 => {
                    out.push(QUESTION_PLACEHOLDER);
                    chars.next();
                }
                Some(next) => {
                    out.push('\\');
                    out.push(*next);
                    chars.next();
                }
                None => out.push('\\'),
            },
            '(' => {
                paren_depth += 1;
                out.push(c);
            }
            ')' => {
                paren_depth = (paren_depth - 1).max(0);
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Restore phase-1 placeholders back to their literal sigil, run last so
/// nothing downstream reinterprets an escaped character (§4.4 "After
/// phase 3, placeholders are restored").
fn restore_escapes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            DOLLAR_PLACEHOLDER => '$',
            TILDE_PLACEHOLDER => '~',
            QUESTION_PLACEHOLDER => '?',
            other => other,
        })
        .collect()
}

/// Entry point: run all three phases of substitution over `text` against
/// `frame`, invoking `on_done` with the rewritten text (or failure) once
/// every brace inside it has resolved. May call `on_done` synchronously
/// (text had no async braces) or later, from whatever resumes the
/// suspending token.
pub fn substitute(
    executor: &Arc<Executor>,
    frame: Frame,
    text: String,
    quote: QuoteContext,
    macro_ctx: Option<MacroSubstContext>,
    on_done: Box<dyn FnOnce(Frame, SubstResult) + Send>,
) {
    let protected = protect_escapes(&text);
    let spans = find_top_level_braces(&protected);
    if spans.is_empty() {
        finish_phase3(executor, frame, protected, macro_ctx, on_done);
        return;
    }
    substitute_braces(Arc::clone(executor), frame, protected, spans, quote, macro_ctx, on_done);
}

/// Phase 2: dispatch every brace span's content as a command sequence,
/// join completion through a brace coordinator token (C6), then continue
/// to phase 3 once every brace has a result (§4.6 "Ordering").
fn substitute_braces(
    executor: Arc<Executor>,
    frame: Frame,
    protected_text: String,
    spans: Vec<BraceSpan>,
    _quote: QuoteContext,
    macro_ctx: Option<MacroSubstContext>,
    on_done: Box<dyn FnOnce(Frame, SubstResult) + Send>,
) {
    let governing_token = frame.suspend_parent;
    let parent = Arc::new(Mutex::new(Some(frame)));
    let spans_for_coordinator: Vec<(usize, usize, Option<String>)> =
        spans.iter().map(|s| (s.start, s.end, None)).collect();

    let parent_for_resume = Arc::clone(&parent);
    let executor_for_resume = Arc::clone(&executor);
    let macro_ctx_for_resume = macro_ctx.clone();
    let coordinator_token_cell: Arc<Mutex<Option<TokenId>>> = Arc::new(Mutex::new(None));
    let coordinator_token_for_resume = Arc::clone(&coordinator_token_cell);
    let resume_callback: Box<dyn FnOnce(Result<String, ()>) + Send> = Box::new(move |spliced| {
        if let Some(token) = *coordinator_token_for_resume.lock().expect("coordinator token cell lock poisoned") {
            executor_for_resume.tokens.force_cleanup(token);
        }
        let frame = parent_for_resume
            .lock()
            .expect("brace coordinator parent frame lock poisoned")
            .take()
            .expect("brace coordinator resumed with no parent frame to hand back");
        match spliced {
            Ok(text) => finish_phase3(&executor_for_resume, frame, text, macro_ctx_for_resume, on_done),
            Err(()) => on_done(frame, Err(())),
        }
    });

    let coordinator_id = executor
        .tokens
        .request_brace_coordinator(spans_for_coordinator, protected_text, resume_callback);

    // A structural token with no timer purpose of its own, requested only
    // so every async brace child below registers as its descendant (§4.6
    // "reparents every async child brace under it"). Parented to whatever
    // token this frame's own dispatch is already suspended under, if any,
    // so a cascade-cancel of that outer token tears down every brace still
    // in flight here too (§5 "a parent's cleanup cancels all descendant
    // tokens"). Its cleanup resolves the coordinator as failed if it is
    // cascade-cancelled before every span has reported; removed directly
    // (bypassing that cleanup) once the coordinator finishes on its own,
    // well before its own deadline in the overwhelmingly common case
    // nothing above ever cancels it first.
    let executor_for_cleanup = Arc::clone(&executor);
    let coordinator_token = executor.tokens.request_token(
        Some(Box::new(move || {
            executor_for_cleanup.tokens.fail_coordinator(coordinator_id);
        })),
        governing_token,
        executor.config.default_token_timeout,
        Position::new(1, 1),
        false,
    );
    *coordinator_token_cell.lock().expect("coordinator token cell lock poisoned") = Some(coordinator_token);

    for (idx, span) in spans.into_iter().enumerate() {
        let executor = Arc::clone(&executor);
        let parent = Arc::clone(&parent);
        let seq = crate::command::parse_sequence(&span.content, 1);
        let child = {
            let guard = parent.lock().expect("brace coordinator parent frame lock poisoned");
            let p = guard
                .as_ref()
                .expect("parent frame missing before all brace children were dispatched");
            let mut child = Frame::child_shared_vars(p);
            child.suspend_parent = Some(coordinator_token);
            child
        };
        let in_quotes = span.in_quotes;
        let is_unescape = span.is_unescape;
        let macro_ctx_for_child = macro_ctx.clone();

        executor.run_sequence_in(
            child,
            seq,
            macro_ctx_for_child,
            Box::new(move |mut child_frame, outcome| {
                let (status, explicit_value) = match outcome {
                    HandlerOutcome::BoolStatus(s) => (s, None),
                    HandlerOutcome::EarlyReturn {
                        status,
                        result,
                        has_result,
                    } => (status, if has_result { result } else { None }),
                    HandlerOutcome::TokenResult(_) => {
                        unreachable!("run_sequence resolves tokens before invoking its callback")
                    }
                };
                let value = explicit_value
                    .or_else(|| child_frame.result().cloned())
                    .unwrap_or(Value::Undefined);

                {
                    let mut guard = parent.lock().expect("brace coordinator parent frame lock poisoned");
                    if let Some(parent_frame) = guard.as_mut() {
                        for r in extract_refs(&value) {
                            child_frame.transfer_to(parent_frame, r);
                        }
                    }
                }
                child_frame.release_all();

                let formatted = format_brace_value(&executor.store, &value, in_quotes, is_unescape);
                executor.tokens.report_brace_result(coordinator_id, idx, Some(formatted), !status);
            }),
        );
    }
}

/// Phase 3, then placeholder restoration.
fn finish_phase3(
    _executor: &Arc<Executor>,
    mut frame: Frame,
    text: String,
    macro_ctx: Option<MacroSubstContext>,
    on_done: Box<dyn FnOnce(Frame, SubstResult) + Send>,
) {
    let expanded = match macro_ctx {
        Some(ctx) => match expand_dollar_tilde(&text, &mut frame, &ctx) {
            Ok(s) => s,
            Err(()) => {
                on_done(frame, Err(()));
                return;
            }
        },
        None => text,
    };
    on_done(frame, Ok(restore_escapes(&expanded)));
}

/// A whole argument that is nothing but `~name`/`?name` — outside any
/// quoting, this is a direct variable/object reference rather than text to
/// interpolate (the outside-quotes analogue of `$N`'s "wrapped/markered to
/// preserve token boundaries" rule, applied to `~`/`?` so `set M, ~L`
/// copies `L`'s value, identity included, instead of formatting it to
/// display text that is then re-parsed).
fn bare_name_ref(text: &str, sigil: char) -> Option<&str> {
    let rest = text.strip_prefix(sigil)?;
    (!rest.is_empty() && rest.chars().all(|c| c.is_alphanumeric() || c == '_')).then_some(rest)
}

/// Phase 3 proper: `$*`/`$@`/`$#`/`$N`, a whole-argument bare `~name`/
/// `?name` reference, and (inside quotes, outside parens) `~name`/`?name`
/// interpolation (§4.4 phase 3).
fn expand_dollar_tilde(text: &str, frame: &mut Frame, ctx: &MacroSubstContext) -> Result<String, ()> {
    if let Some(name) = bare_name_ref(text, '~') {
        return match resolve_name(frame, name) {
            Some(value) => Ok(format_positional(&frame.store, &value, false)),
            None => Err(()),
        };
    }
    if let Some(name) = bare_name_ref(text, '?') {
        let defined = resolve_name(frame, name).map(|v| !v.is_undefined()).unwrap_or(false);
        return Ok(if defined { "true" } else { "false" }.to_string());
    }

    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_quotes = false;
    let mut paren_depth: i32 = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' if paren_depth == 0 => {
                in_quotes = !in_quotes;
                out.push(c);
                i += 1;
            }
            '(' => {
                paren_depth += 1;
                out.push(c);
                i += 1;
            }
            ')' => {
                paren_depth = (paren_depth - 1).max(0);
                out.push(c);
                i += 1;
            }
            '$' => {
                i += 1;
                if i >= chars.len() {
                    out.push('$');
                    break;
                }
                match chars[i] {
                    '*' => {
                        out.push_str(&join_display(&frame.store, &ctx.args));
                        i += 1;
                    }
                    '@' => {
                        out.push_str(&encode_marker(ctx.args_list.kind, ctx.args_list.id));
                        i += 1;
                    }
                    '#' => {
                        out.push_str(&ctx.args.len().to_string());
                        i += 1;
                    }
                    d if d.is_ascii_digit() => {
                        let start = i;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                        let n: usize = chars[start..i].iter().collect::<String>().parse().unwrap_or(0);
                        if let Some(value) = n.checked_sub(1).and_then(|idx| ctx.args.get(idx)) {
                            out.push_str(&format_positional(&frame.store, value, in_quotes));
                        }
                    }
                    _ => out.push('$'),
                }
            }
            '~' if in_quotes && paren_depth == 0 => {
                i += 1;
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                match resolve_name(frame, &name) {
                    Some(value) => out.push_str(&display_inline(&frame.store, &value)),
                    None => return Err(()),
                }
            }
            '?' if in_quotes && paren_depth == 0 => {
                i += 1;
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                let defined = resolve_name(frame, &name).map(|v| !v.is_undefined()).unwrap_or(false);
                out.push_str(if defined { "true" } else { "false" });
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    Ok(out)
}

fn resolve_name(frame: &Frame, name: &str) -> Option<Value> {
    frame
        .get_variable(name)
        .or_else(|| frame.module_env.lookup_object(name))
}

fn join_display(store: &ObjectStore, values: &[Value]) -> String {
    values
        .iter()
        .map(|v| display_inline(store, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `$N` outside quotes is wrapped/markered to preserve token boundaries;
/// inside quotes it's just the display content (§4.4 phase 3, `$N`).
fn format_positional(store: &ObjectStore, value: &Value, in_quotes: bool) -> String {
    if in_quotes {
        display_inline(store, value)
    } else {
        format_brace_value(store, value, false, false)
    }
}

/// Render `value` for the *display* context (inside quotes, or `~name`
/// interpolation): lists use a canonical paren representation, everything
/// else its natural text form — never a marker, since display text is
/// meant to be read, not re-parsed (§4.4 phase 2, "formatted for
/// display").
fn display_inline(store: &ObjectStore, value: &Value) -> String {
    match value {
        Value::ObjectRef(r) if r.kind == ObjectKind::List => store
            .with(*r, |payload| match payload {
                StoredPayload::List { items, .. } => {
                    format!("({})", items.iter().map(|v| display_inline(store, v)).collect::<Vec<_>>().join(", "))
                }
                _ => String::new(),
            })
            .unwrap_or_default(),
        Value::ObjectRef(r) => encode_marker(r.kind, r.id),
        Value::Undefined => String::new(),
        other => other.to_string(),
    }
}

/// Escape quotes/backslashes and neutralize `~`/`?` so a value spliced
/// into quoted text isn't re-interpreted by phase 3 (§4.4 phase 2,
/// "inside quotes: ... quotes/backslashes escaped, and tildes/question-
/// marks escaped to placeholders").
fn escape_for_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '~' => out.push(TILDE_PLACEHOLDER),
            '?' => out.push(QUESTION_PLACEHOLDER),
            other => out.push(other),
        }
    }
    out
}

fn strip_outer_parens_or_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        if (bytes[0] == b'(' && bytes[bytes.len() - 1] == b')')
            || (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// Format a brace's (or `$N`'s) result according to its quote context and
/// whether it's a splat (`${...}`) (§4.4 phase 2's formatting rules).
/// `pub(crate)` so the template fast path in `executor.rs` renders a
/// single-expression argument's raw-text echo with the exact same rule
/// the phase-based brace engine uses, rather than duplicating it.
pub(crate) fn format_brace_value(store: &ObjectStore, value: &Value, in_quotes: bool, is_unescape: bool) -> String {
    let mut formatted = if in_quotes {
        escape_for_quotes(&display_inline(store, value))
    } else {
        format_outside_quotes(value)
    };
    if is_unescape {
        formatted = strip_outer_parens_or_quotes(&formatted);
    }
    formatted
}

/// Outside quotes: typed values produce markers (identity survives);
/// booleans/numbers are bare; strings are wrapped in quotes (§4.4 phase
/// 2). `pub(crate)` so the template fast path in `executor.rs` can render
/// a raw-text echo of a directly-resolved value without re-deriving this
/// formatting rule.
pub(crate) fn format_outside_quotes(value: &Value) -> String {
    match value {
        Value::ObjectRef(r) => encode_marker(r.kind, r.id),
        Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        Value::Int64(n) => n.to_string(),
        Value::Float64(f) => f.to_string(),
        Value::Nil => "nil".to_string(),
        Value::Undefined => String::new(),
        Value::Symbol(s) => s.clone(),
        Value::QuotedString(s) => format!("\"{}\"", escape_for_quotes(s)),
        Value::ParenGroup(s) => format!("({s})"),
    }
}

/// Interpret a fully-substituted argument string as a literal [`Value`]
/// (§3 Value variants): a marker decodes to `ObjectRef`; `true`/`false`
/// to `Bool`; a bare integer/float to `Int64`/`Float64`; `"..."` to
/// `QuotedString`; `(...)` to `ParenGroup`; anything else is a bare
/// `Symbol`. This is the non-template path's equivalent of "single-
/// expression templates bypass string encoding" (§4.4 template caching):
/// every substituted string still ends up typed before a handler sees it.
pub fn literal_value(text: &str) -> Value {
    if let Some((kind, id)) = pawscript_core::parse_marker(text) {
        return Value::ObjectRef(ObjectRef::new(kind, id));
    }
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        return Value::QuotedString(unescape_quoted(&text[1..text.len() - 1]));
    }
    if text.len() >= 2 && text.starts_with('(') && text.ends_with(')') {
        return Value::ParenGroup(text[1..text.len() - 1].to_string());
    }
    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "nil" => return Value::Nil,
        "undefined" => return Value::Undefined,
        _ => {}
    }
    if let Ok(n) = text.parse::<i64>() {
        return Value::Int64(n);
    }
    if !text.is_empty() && text.parse::<f64>().is_ok() && text.contains('.') {
        return Value::Float64(text.parse().unwrap());
    }
    Value::Symbol(text.to_string())
}

fn unescape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::StderrLogger;
    use pawscript_core::ModuleEnv;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn test_executor() -> Arc<Executor> {
        Executor::new(Arc::new(StderrLogger))
    }

    fn frame(executor: &Arc<Executor>) -> Frame {
        Frame::new_root(Arc::clone(&executor.store), ModuleEnv::root())
    }

    fn run_substitute(executor: &Arc<Executor>, frame: Frame, text: &str) -> (Frame, SubstResult) {
        let (tx, rx) = std::sync::mpsc::channel();
        substitute(
            executor,
            frame,
            text.to_string(),
            QuoteContext::Outside,
            None,
            Box::new(move |frame, result| {
                let _ = tx.send((frame, result));
            }),
        );
        rx.recv().expect("substitution never completed")
    }

    #[test]
    fn plain_text_with_no_braces_passes_through() {
        let executor = test_executor();
        let (_frame, result) = run_substitute(&executor, frame(&executor), "hello world");
        assert_eq!(result, Ok("hello world".to_string()));
    }

    #[test]
    fn escaped_dollar_survives_as_literal() {
        let executor = test_executor();
        let (_frame, result) = run_substitute(&executor, frame(&executor), r"cost: \$5");
        assert_eq!(result, Ok("cost: $5".to_string()));
    }

    #[test]
    fn brace_runs_a_command_and_splices_result() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        executor.register_command(&module, "five", |ctx: &mut crate::executor::Context<'_>| {
            ctx.frame.set_result(Value::Int64(5));
            HandlerOutcome::BoolStatus(true)
        });
        let f = Frame::new_root(Arc::clone(&executor.store), module);
        let (_frame, result) = run_substitute(&executor, f, "value is {five}");
        assert_eq!(result, Ok("value is 5".to_string()));
    }

    #[test]
    fn two_braces_both_splice_at_original_positions() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        executor.register_command(&module, "a", |ctx: &mut crate::executor::Context<'_>| {
            ctx.frame.set_result(Value::Symbol("A".to_string()));
            HandlerOutcome::BoolStatus(true)
        });
        executor.register_command(&module, "b", |ctx: &mut crate::executor::Context<'_>| {
            ctx.frame.set_result(Value::Symbol("B".to_string()));
            HandlerOutcome::BoolStatus(true)
        });
        let f = Frame::new_root(Arc::clone(&executor.store), module);
        let (_frame, result) = run_substitute(&executor, f, "{a}-{b}");
        assert_eq!(result, Ok("A-B".to_string()));
    }

    #[test]
    fn cascade_cancel_reaches_a_token_nested_inside_a_brace() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        let cleaned = Arc::new(AtomicBool::new(false));
        let cleaned_for_handler = Arc::clone(&cleaned);
        executor.register_command(&module, "suspend_forever", move |ctx: &mut crate::executor::Context<'_>| {
            let cleaned = Arc::clone(&cleaned_for_handler);
            let id = ctx.request_token(Some(Box::new(move || {
                cleaned.store(true, Ordering::SeqCst);
            })));
            HandlerOutcome::TokenResult(id)
        });

        // An outer token standing in for some already-pending async
        // construct (e.g. a timeout) this substitution is running under.
        let outer_token =
            executor
                .tokens
                .request_token(None, None, Duration::from_secs(60), Position::new(1, 1), false);
        let mut f = Frame::new_root(Arc::clone(&executor.store), module);
        f.suspend_parent = Some(outer_token);

        substitute(
            &executor,
            f,
            "prefix {suspend_forever} suffix".to_string(),
            QuoteContext::Outside,
            None,
            Box::new(|_frame, _result| {}),
        );

        assert!(!cleaned.load(Ordering::SeqCst), "must not run before anything cancels it");
        executor.tokens.force_cleanup(outer_token);
        assert!(
            cleaned.load(Ordering::SeqCst),
            "cancelling the outer token must cascade through the brace coordinator into the still-open nested token"
        );
    }

    #[test]
    fn failing_brace_fails_whole_substitution() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        executor.register_command(&module, "bad", |_ctx: &mut crate::executor::Context<'_>| {
            HandlerOutcome::BoolStatus(false)
        });
        let f = Frame::new_root(Arc::clone(&executor.store), module);
        let (_frame, result) = run_substitute(&executor, f, "x{bad}y");
        assert_eq!(result, Err(()));
    }

    #[test]
    fn literal_value_decodes_markers_and_scalars() {
        assert_eq!(literal_value("true"), Value::Bool(true));
        assert_eq!(literal_value("42"), Value::Int64(42));
        assert_eq!(literal_value("3.5"), Value::Float64(3.5));
        assert_eq!(literal_value("bareword"), Value::Symbol("bareword".to_string()));
        assert_eq!(
            literal_value("\"quoted\""),
            Value::QuotedString("quoted".to_string())
        );
        let marker = encode_marker(ObjectKind::List, 9);
        assert_eq!(literal_value(&marker), Value::ObjectRef(ObjectRef::new(ObjectKind::List, 9)));
    }

    #[test]
    fn dollar_hash_and_star_expand_from_macro_context() {
        let executor = test_executor();
        let mut f = frame(&executor);
        let args = vec![Value::Int64(1), Value::Int64(2)];
        let args_list = executor.store.register(
            StoredPayload::List {
                items: args.clone(),
                named: vec![],
            },
            ObjectKind::List,
        );
        f.claim_object(args_list);
        let ctx = MacroSubstContext {
            args: Arc::new(args),
            named: Arc::new(HashMap::new()),
            args_list,
            template_cache: None,
            call_chain: None,
        };
        let result = expand_dollar_tilde("count=$#, all=$*", &mut f, &ctx).unwrap();
        assert_eq!(result, "count=2, all=1, 2");
    }

    #[test]
    fn tilde_and_question_resolve_against_variables() {
        let executor = test_executor();
        let mut f = frame(&executor);
        f.set_variable("x", Value::Int64(7));
        let ctx = MacroSubstContext {
            args: Arc::new(vec![]),
            named: Arc::new(HashMap::new()),
            args_list: executor.store.register(
                StoredPayload::List { items: vec![], named: vec![] },
                ObjectKind::List,
            ),
            template_cache: None,
            call_chain: None,
        };
        let result = expand_dollar_tilde(r#""value is ~x, has y? ?y""#, &mut f, &ctx).unwrap();
        assert_eq!(result, r#""value is 7, has y? false""#);
    }

    #[test]
    fn bare_tilde_argument_resolves_to_the_variable_itself() {
        let executor = test_executor();
        let mut f = frame(&executor);
        f.set_variable("x", Value::Int64(7));
        let ctx = MacroSubstContext {
            args: Arc::new(vec![]),
            named: Arc::new(HashMap::new()),
            args_list: executor.store.register(
                StoredPayload::List { items: vec![], named: vec![] },
                ObjectKind::List,
            ),
            template_cache: None,
            call_chain: None,
        };
        let result = expand_dollar_tilde("~x", &mut f, &ctx).unwrap();
        assert_eq!(result, "7");
    }

    #[test]
    fn bare_question_argument_reports_definedness() {
        let executor = test_executor();
        let mut f = frame(&executor);
        let ctx = MacroSubstContext {
            args: Arc::new(vec![]),
            named: Arc::new(HashMap::new()),
            args_list: executor.store.register(
                StoredPayload::List { items: vec![], named: vec![] },
                ObjectKind::List,
            ),
            template_cache: None,
            call_chain: None,
        };
        assert_eq!(expand_dollar_tilde("?missing", &mut f, &ctx).unwrap(), "false");
    }

    #[test]
    fn undefined_reference_inside_quotes_fails() {
        let executor = test_executor();
        let mut f = frame(&executor);
        let ctx = MacroSubstContext {
            args: Arc::new(vec![]),
            named: Arc::new(HashMap::new()),
            args_list: executor.store.register(
                StoredPayload::List { items: vec![], named: vec![] },
                ObjectKind::List,
            ),
            template_cache: None,
            call_chain: None,
        };
        assert!(expand_dollar_tilde(r#""~missing""#, &mut f, &ctx).is_err());
    }
}
