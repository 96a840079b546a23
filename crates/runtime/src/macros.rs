//! Macro runtime (C7): user-defined commands whose body is PawScript
//! source text, invoked through the same dispatch pipeline as a builtin
//! handler (§4.7 `execute_macro`).
//!
//! A macro's body may suspend on a token just like any other command
//! sequence, but [`Handler::call`] must still return a synchronous
//! [`HandlerOutcome`] — the same shape the teacher's `execute_with_state`
//! already bridges with an `mpsc` channel, so macro invocation reuses
//! that exact bridge rather than inventing a second suspension protocol.
//! The calling OS thread blocks for the duration of the body; this is a
//! deliberate simplification (see `DESIGN.md`), not an oversight.

use crate::executor::{Context, Executor, Handler, HandlerOutcome};
use crate::logger::LogLevel;
use crate::substitution::MacroSubstContext;
use crate::template::ArgTemplateCache;
use pawscript_core::{Frame, ModuleEnv, ObjectKind, ObjectStore, PawError, Position, StoredPayload, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Upper bound on nested macro invocations (§7 `MacroError` "too-deep
/// macro recursion"). A self-recursive macro with no base case would
/// otherwise grow `body_frame`'s call chain until the OS thread stack
/// overflows, since each nested `execute_macro` call blocks its caller's
/// thread on the child's `mpsc` channel (see module docs above).
const MAX_MACRO_DEPTH: u32 = 256;

/// A stored macro definition (§4.7; §3 "Macro" object kind). Registered
/// into a [`ModuleEnv`]'s macro namespace as an `ObjectRef`, and kept
/// here by the executor's macro table the same way command handlers are
/// kept in its command table — neither lives in the object store proper.
pub struct MacroDef {
    pub name: String,
    pub body: String,
    /// The environment the macro was *defined* in — invoking it must
    /// close over this, not the call site's environment (§4.7 step 2,
    /// lexical macro scoping).
    pub module_env: ModuleEnv,
    pub position: Position,
    pub is_forward: bool,
    /// Populated only under `OptimizationLevel::Basic` (§6 "Parsed-
    /// command cache... skipped when the text contains `$N` patterns").
    /// Shared (`Arc`) so a [`MacroSubstContext`] can hold a cheap handle
    /// to it without borrowing the whole definition.
    pub arg_template_cache: Arc<ArgTemplateCache>,
}

impl MacroDef {
    pub fn new(name: impl Into<String>, body: impl Into<String>, module_env: ModuleEnv, position: Position) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            module_env,
            position,
            is_forward: false,
            arg_template_cache: Arc::new(ArgTemplateCache::new()),
        }
    }

    pub fn forward(name: impl Into<String>, module_env: ModuleEnv, position: Position) -> Self {
        Self {
            name: name.into(),
            body: String::new(),
            module_env,
            position,
            is_forward: true,
            arg_template_cache: Arc::new(ArgTemplateCache::new()),
        }
    }
}

/// The per-invocation linkage used for stack-trace formation (§4.7 step
/// 1): definition site, invocation site, and the caller's own context if
/// this macro was itself invoked from inside another macro's body.
pub struct MacroContext {
    pub macro_name: String,
    pub definition_position: Position,
    pub invocation_position: Position,
    pub parent: Option<Arc<MacroContext>>,
}

impl MacroContext {
    /// Render the call chain from this invocation (innermost) out to the
    /// root, for the "macro call chain" §7 Propagation requires alongside
    /// position when an error is logged.
    pub fn format_chain(self: &Arc<Self>) -> String {
        let mut frames = Vec::new();
        let mut current = Some(Arc::clone(self));
        while let Some(ctx) = current {
            frames.push(format!(
                "{} (defined at {}, invoked at {})",
                ctx.macro_name, ctx.definition_position, ctx.invocation_position
            ));
            current = ctx.parent.clone();
        }
        frames.join(" <- ")
    }
}

/// [`Handler`] adapter that runs a [`MacroDef`]'s body (§4.7). Registered
/// into the executor's command table exactly like any builtin — callers
/// dispatch through `lookup_handler` without knowing whether `name`
/// resolved to a builtin or a macro.
pub struct MacroHandler {
    pub def: Arc<MacroDef>,
}

impl Handler for MacroHandler {
    fn call(&self, ctx: &mut Context<'_>) -> HandlerOutcome {
        if self.def.is_forward {
            ctx.log_error(&format!("macro '{}' is a forward declaration with no body", self.def.name));
            return HandlerOutcome::BoolStatus(false);
        }
        let (status, result) = execute_macro(
            ctx.executor,
            Arc::clone(&self.def),
            ctx.args.clone(),
            ctx.named_args.clone(),
            Some(ctx.frame),
            ctx.position,
            ctx.macro_chain.clone(),
        );
        match result {
            Some(value) => HandlerOutcome::EarlyReturn {
                status,
                result: Some(value),
                has_result: true,
            },
            None => HandlerOutcome::BoolStatus(status),
        }
    }
}

/// Run `def`'s body against `args`/`named` (§4.7 `execute_macro`).
/// `parent_frame`, if given, receives the merged `exports` and the
/// transferred result's refs (step 5-6); it is the caller's frame, not
/// touched until the body has fully completed.
///
/// `parent_chain` is the enclosing macro invocation's [`MacroContext`], if
/// this call is itself nested inside another macro's body (§4.7 step 1
/// "parent linkage for stack-trace formation"); `None` when this is a
/// fresh call-chain root (top-level dispatch, a spawned fiber, or a direct
/// `execute_stored_macro` call).
pub fn execute_macro(
    executor: &Arc<Executor>,
    def: Arc<MacroDef>,
    args: Vec<Value>,
    named: HashMap<String, Value>,
    parent_frame: Option<&mut Frame>,
    invocation_pos: Position,
    parent_chain: Option<Arc<MacroContext>>,
) -> (bool, Option<Value>) {
    let macro_ctx_chain = Arc::new(MacroContext {
        macro_name: def.name.clone(),
        definition_position: def.position,
        invocation_position: invocation_pos,
        parent: parent_chain,
    });

    let mut body_frame = match parent_frame.as_deref() {
        Some(p) => Frame::child_fresh(p),
        None => Frame::new_root(Arc::clone(&executor.store), def.module_env.clone()),
    };
    if body_frame.macro_depth > MAX_MACRO_DEPTH {
        let err = PawError::macro_err(
            format!(
                "macro '{}' exceeded maximum nesting depth of {MAX_MACRO_DEPTH}",
                def.name
            ),
            invocation_pos,
        )
        .with_call_chain(macro_ctx_chain.format_chain());
        executor.log(LogLevel::Error, Some(invocation_pos), &err.to_string());
        return (false, None);
    }
    // Lexical scoping (§4.7 step 2): close over the macro's *defining*
    // environment, not the call site's — `child_fresh` otherwise inherits
    // the latter.
    body_frame.module_env = def.module_env.child();

    let args_list = build_args_list(&executor.store, &args, &named);
    body_frame.claim_object(args_list);

    let macro_ctx = MacroSubstContext {
        args: Arc::new(args),
        named: Arc::new(named),
        args_list,
        template_cache: Some(Arc::clone(&def.arg_template_cache)),
        call_chain: Some(macro_ctx_chain),
    };

    let seq = crate::command::parse_sequence(&def.body, def.position.line);
    let (tx, rx) = std::sync::mpsc::channel();
    executor.run_sequence_in(
        body_frame,
        seq,
        Some(macro_ctx),
        Box::new(move |frame, outcome| {
            let _ = tx.send((frame, outcome));
        }),
    );
    let (mut frame, outcome) = rx.recv().expect("macro body sequence never completed");

    let (status, mut result) = match outcome {
        HandlerOutcome::BoolStatus(s) => (s, frame.result().cloned()),
        HandlerOutcome::EarlyReturn { status, result, has_result } => {
            (status, if has_result { result } else { frame.result().cloned() })
        }
        HandlerOutcome::TokenResult(_) => unreachable!("resolved before execute_macro observes it"),
    };

    let exports = frame.module_env.take_exports();
    if let Some(parent) = parent_frame {
        parent.module_env.merge_exports(exports);
        if let Some(value) = result.take() {
            for r in pawscript_core::extract_refs(&value) {
                frame.transfer_to(parent, r);
            }
            result = Some(value);
        }
    }
    frame.release_all();
    (status, result)
}

/// Build the `$@` backing list: positional args followed by named pairs
/// (§4.7 step 3). Registered with ref count zero; the caller claims it
/// through the macro's own frame.
fn build_args_list(
    store: &ObjectStore,
    args: &[Value],
    named: &HashMap<String, Value>,
) -> pawscript_core::ObjectRef {
    let named_pairs: Vec<(String, Value)> = named.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    store.register(
        StoredPayload::List {
            items: args.to_vec(),
            named: named_pairs,
        },
        ObjectKind::List,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::StderrLogger;

    fn test_executor() -> Arc<Executor> {
        Executor::new(Arc::new(StderrLogger))
    }

    #[test]
    fn macro_body_runs_and_returns_result() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        executor.register_command(&module, "five", |ctx: &mut Context<'_>| {
            ctx.frame.set_result(Value::Int64(5));
            HandlerOutcome::BoolStatus(true)
        });
        let def = Arc::new(MacroDef::new("get_five", "five", module.clone(), Position::new(1, 1)));
        let mut frame = Frame::new_root(Arc::clone(&executor.store), module);
        let (status, result) = execute_macro(&executor, def, vec![], HashMap::new(), Some(&mut frame), Position::new(1, 1), None);
        assert!(status);
        assert_eq!(result, Some(Value::Int64(5)));
        frame.release_all();
    }

    #[test]
    fn forward_declaration_fails_when_invoked() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        let def = Arc::new(MacroDef::forward("todo", module.clone(), Position::new(1, 1)));
        let mut frame = Frame::new_root(Arc::clone(&executor.store), module);
        let (status, result) = execute_macro(&executor, def, vec![], HashMap::new(), Some(&mut frame), Position::new(1, 1), None);
        assert!(!status);
        assert!(result.is_none());
        frame.release_all();
    }

    #[test]
    fn dollar_star_expands_bound_arguments_in_macro_body() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        executor.register_command(&module, "echo", |ctx: &mut Context<'_>| {
            ctx.frame.set_result(ctx.args.first().cloned().unwrap_or(Value::Undefined));
            HandlerOutcome::BoolStatus(true)
        });
        let def = Arc::new(MacroDef::new("greet", r#"echo "hi $*""#, module.clone(), Position::new(1, 1)));
        let mut frame = Frame::new_root(Arc::clone(&executor.store), module);
        let (status, result) = execute_macro(
            &executor,
            def,
            vec![Value::Symbol("world".to_string())],
            HashMap::new(),
            Some(&mut frame),
            Position::new(1, 1),
            None,
        );
        assert!(status);
        assert_eq!(result, Some(Value::QuotedString("hi world".to_string())));
        frame.release_all();
    }

    #[test]
    fn self_recursive_macro_fails_once_past_max_depth_instead_of_overflowing() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        let def = Arc::new(MacroDef::new("loop_forever", "loop_forever", module.clone(), Position::new(1, 1)));
        executor.register_command(&module, "loop_forever", MacroHandler { def: Arc::clone(&def) });
        let mut frame = Frame::new_root(Arc::clone(&executor.store), module);
        let (status, result) = execute_macro(&executor, def, vec![], HashMap::new(), Some(&mut frame), Position::new(1, 1), None);
        assert!(!status, "recursion past MAX_MACRO_DEPTH must fail rather than hang or overflow");
        assert!(result.is_none());
        frame.release_all();
        assert_eq!(executor.store.stats().live_objects, 0, "every nested invocation's args list must still be released");
    }

    #[test]
    fn exports_merge_into_caller_module_env() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        executor.register_command(&module, "export_one", |ctx: &mut Context<'_>| {
            ctx.frame.module_env.add_export("answer", Value::Int64(42));
            HandlerOutcome::BoolStatus(true)
        });
        let def = Arc::new(MacroDef::new("exporter", "export_one", module.clone(), Position::new(1, 1)));
        let mut frame = Frame::new_root(Arc::clone(&executor.store), module);
        let (status, _) = execute_macro(&executor, def, vec![], HashMap::new(), Some(&mut frame), Position::new(1, 1), None);
        assert!(status);
        assert_eq!(frame.module_env.lookup_object("answer"), Some(Value::Int64(42)));
        frame.release_all();
    }

    #[derive(Default)]
    struct CapturingLogger {
        lines: std::sync::Mutex<Vec<String>>,
    }

    impl crate::logger::Logger for CapturingLogger {
        fn log(&self, _level: crate::logger::LogLevel, _position: Option<Position>, message: &str) {
            self.lines.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn nested_macro_invocation_builds_a_call_chain() {
        let logger = Arc::new(CapturingLogger::default());
        let executor = Executor::new(Arc::clone(&logger) as Arc<dyn crate::logger::Logger>);
        let module = ModuleEnv::root();

        // `outer` invokes `inner`, which invokes a builtin that directly
        // logs a `PawError` via `ctx.log_error` — §7's requirement that
        // the chain be available wherever an error is logged mid-macro,
        // not only at the recursion-depth guard.
        executor.register_command(&module, "fail_here", |ctx: &mut Context<'_>| {
            let err = pawscript_core::PawError::argument("deliberate failure", ctx.position)
                .with_call_chain(ctx.macro_chain.as_ref().map(|c| c.format_chain()).unwrap_or_default());
            ctx.log_error(&err.to_string());
            HandlerOutcome::BoolStatus(false)
        });
        executor.register_macro(&module, MacroDef::new("inner", "fail_here", module.clone(), Position::new(2, 1)));
        executor.register_macro(&module, MacroDef::new("outer", "inner", module.clone(), Position::new(1, 1)));

        let frame = Frame::new_root(Arc::clone(&executor.store), module);
        assert!(!executor.execute_with_state("outer", frame, 5));

        let lines = logger.lines.lock().unwrap();
        let logged = lines.iter().find(|l| l.contains("deliberate failure")).expect("error was not logged");
        assert!(logged.contains("called from:"), "error must surface the call chain: {logged}");
        assert!(logged.contains("inner (defined at"), "chain must name the inner frame: {logged}");
        assert!(logged.contains("outer (defined at"), "chain must name the outer frame: {logged}");
    }
}
