//! Command executor (C5): dispatches a parsed command, resolves its
//! arguments through substitution, invokes the registered handler, and
//! drives sequence resumption.
//!
//! The dispatch loop is continuation-passing: every step owns its
//! [`Frame`] and hands it to the next step (or back to the caller) rather
//! than borrowing it, because a handler may suspend by returning
//! [`HandlerOutcome::TokenResult`] and resume arbitrarily later (possibly
//! from the timer thread in `token.rs`, possibly from a test calling
//! `tokens.resume` directly) — a borrowed `&mut Frame` cannot outlive that
//! gap, but an owned value moved into the continuation can. This mirrors
//! the teacher's registry discipline (`channel.rs`): never hold a lock (or
//! here, a borrow) across a call that might not return promptly.

use crate::command::{CommandInvocation, CommandSequence, Connector};
use crate::config::ExecutorConfig;
use crate::logger::{LogLevel, Logger};
use crate::token::{CleanupFn, TokenId, TokenTable};
use pawscript_core::{
    ErrorKind, Frame, ModuleEnv, ObjectKind, ObjectRef, ObjectStore, PawError, Position, StoredPayload, Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// What a [`Handler`] returns (§4.5 step 4).
pub enum HandlerOutcome {
    BoolStatus(bool),
    TokenResult(TokenId),
    EarlyReturn {
        status: bool,
        result: Option<Value>,
        has_result: bool,
    },
}

/// A registered command implementation. Handlers are the stdlib's job
/// (arithmetic, string ops, I/O, ...) — an external collaborator per §1;
/// this trait is the seam they plug into.
pub trait Handler: Send + Sync {
    fn call(&self, ctx: &mut Context<'_>) -> HandlerOutcome;
}

impl<F> Handler for F
where
    F: Fn(&mut Context<'_>) -> HandlerOutcome + Send + Sync,
{
    fn call(&self, ctx: &mut Context<'_>) -> HandlerOutcome {
        self(ctx)
    }
}

/// The Handler `Context` API (§6): arguments, position, the frame to
/// read/write variables and result against, and the token/log surface.
pub struct Context<'a> {
    pub args: Vec<Value>,
    pub raw_args: Vec<String>,
    /// Always empty from this crate's own dispatch path: named-argument
    /// syntax (`name: value`) belongs to the external tokenizer/parser's
    /// grammar (§1), which this crate's minimal `command.rs` splitter does
    /// not implement. The field exists so the `Context` shape matches §6
    /// and so an embedder driving `Context` construction from a real
    /// parser has somewhere to put them.
    pub named_args: HashMap<String, Value>,
    pub position: Position,
    pub frame: &'a mut Frame,
    pub executor: &'a Arc<Executor>,
    /// The [`crate::macros::MacroContext`] of the macro invocation this
    /// dispatch is running inside, if any (§4.7 step 1 "parent linkage for
    /// stack-trace formation"). `MacroHandler::call` reads this to link a
    /// nested macro's own `MacroContext` to its caller's; any handler can
    /// read it to attach the chain to a `PawError` before logging (§7
    /// "errors are logged with position and the macro call chain").
    pub macro_chain: Option<Arc<crate::macros::MacroContext>>,
}

impl Context<'_> {
    /// Request a token, parented to whatever token this dispatch is
    /// itself already suspended under (§4.6 `request_token`; §5 "a
    /// parent's cleanup cancels all descendant tokens"). `None` at the
    /// top of a fresh dispatch; `Some` for, e.g., a brace evaluated while
    /// its enclosing coordinator's governing token is still pending.
    pub fn request_token(&self, cleanup: Option<CleanupFn>) -> TokenId {
        self.executor.tokens.request_token(
            cleanup,
            self.frame.suspend_parent,
            self.executor.config.default_token_timeout,
            self.position,
            false,
        )
    }

    pub fn resume_token(&self, id: TokenId, status: bool) {
        self.executor.tokens.resume(id, status, None);
    }

    pub fn log_error(&self, message: &str) {
        self.executor.log(LogLevel::Error, Some(self.position), message);
    }

    pub fn log_warn(&self, message: &str) {
        self.executor.log(LogLevel::Warn, Some(self.position), message);
    }

    pub fn log_info(&self, message: &str) {
        self.executor.log(LogLevel::Info, Some(self.position), message);
    }

    pub fn log_debug(&self, message: &str) {
        self.executor.log(LogLevel::Debug, Some(self.position), message);
    }
}

/// The embeddable entry point (§6 "Executor lifecycle"). Owns the object
/// store, token table, command/macro registries, and fiber table; all are
/// guarded by their own lock so "critical sections never span external
/// calls" (§5).
pub struct Executor {
    pub store: Arc<ObjectStore>,
    pub tokens: Arc<TokenTable>,
    pub config: ExecutorConfig,
    logger: Arc<dyn Logger>,
    commands: Mutex<HashMap<u64, Arc<dyn Handler>>>,
    next_command_id: AtomicU64,
    fallback: Mutex<Option<Arc<dyn Handler>>>,
    pub(crate) macros: Mutex<HashMap<u64, Arc<crate::macros::MacroDef>>>,
    next_macro_id: AtomicU64,
    pub(crate) fibers: crate::fiber::FiberTable,
    optimization_level: Mutex<crate::config::OptimizationLevel>,
    /// Bubble entries inherited from terminated fibers whose bubbles were
    /// never read before completion (§3 "Bubbles from a dropped fiber
    /// with unread bubbles migrate to the executor's orphan pool").
    orphan_bubbles: Mutex<HashMap<String, Vec<pawscript_core::BubbleEntry>>>,
}

impl Executor {
    pub fn new(logger: Arc<dyn Logger>) -> Arc<Self> {
        Self::with_config(logger, ExecutorConfig::default())
    }

    pub fn with_config(logger: Arc<dyn Logger>, config: ExecutorConfig) -> Arc<Self> {
        let optimization_level = config.optimization_level;
        Arc::new(Self {
            store: Arc::new(ObjectStore::new()),
            tokens: Arc::new(TokenTable::new()),
            config,
            logger,
            commands: Mutex::new(HashMap::new()),
            next_command_id: AtomicU64::new(1),
            fallback: Mutex::new(None),
            macros: Mutex::new(HashMap::new()),
            next_macro_id: AtomicU64::new(1),
            fibers: crate::fiber::FiberTable::new(),
            optimization_level: Mutex::new(optimization_level),
            orphan_bubbles: Mutex::new(HashMap::new()),
        })
    }

    /// Merge a terminated fiber's leftover bubble entries into the
    /// executor-wide orphan pool (§3 "the executor consumes them later"),
    /// called by the fiber scheduler once a task's body has finished.
    pub(crate) fn deposit_orphan_bubbles(&self, bubbles: HashMap<String, Vec<pawscript_core::BubbleEntry>>) {
        let mut pool = self.orphan_bubbles.lock().expect("orphan bubble pool lock poisoned");
        for (flavor, mut entries) in bubbles {
            pool.entry(flavor).or_default().append(&mut entries);
        }
    }

    /// Drain every bubble entry tagged `flavor` out of the orphan pool
    /// (§3 "the executor consumes them later"). Returns an empty `Vec`
    /// if nothing of that flavor has ever migrated in.
    pub fn take_orphan_bubbles(&self, flavor: &str) -> Vec<pawscript_core::BubbleEntry> {
        self.orphan_bubbles
            .lock()
            .expect("orphan bubble pool lock poisoned")
            .remove(flavor)
            .unwrap_or_default()
    }

    pub fn log(&self, level: LogLevel, position: Option<Position>, message: &str) {
        self.logger.log(level, position, message);
    }

    pub fn set_optimization_level(&self, level: crate::config::OptimizationLevel) {
        *self.optimization_level.lock().expect("optimization level lock poisoned") = level;
    }

    pub fn optimization_level(&self) -> crate::config::OptimizationLevel {
        *self.optimization_level.lock().expect("optimization level lock poisoned")
    }

    /// Register a command handler under `name` in `module` (§6
    /// `register_command`). Commands are namespace entries pointing at an
    /// `ObjectRef(Command, id)`, not store-managed payloads — like macros,
    /// they are an externally-owned registry the object store's typed
    /// cleanup list never mentions (§4.2's cleanup table covers
    /// List/Fiber/File/Block/Channel only).
    pub fn register_command(&self, module: &ModuleEnv, name: impl Into<String>, handler: impl Handler + 'static) {
        let id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
        self.commands
            .lock()
            .expect("command registry lock poisoned")
            .insert(id, Arc::new(handler));
        module.register_command(name, ObjectRef::new(ObjectKind::Command, id));
    }

    pub fn register_object(&self, module: &ModuleEnv, name: impl Into<String>, value: Value) {
        module.register_object(name, value);
    }

    pub fn set_fallback(&self, handler: impl Handler + 'static) {
        *self.fallback.lock().expect("fallback handler lock poisoned") = Some(Arc::new(handler));
    }

    fn lookup_handler(&self, module: &ModuleEnv, name: &str) -> Option<Arc<dyn Handler>> {
        if let Some(r) = module.lookup_command(name) {
            if let Some(handler) = self.commands.lock().expect("command registry lock poisoned").get(&r.id) {
                return Some(Arc::clone(handler));
            }
        }
        self.fallback.lock().expect("fallback handler lock poisoned").clone()
    }

    /// Parse and run top-level source text (§6 `execute`). Blocks until
    /// the (purely synchronous) result is known; any command that
    /// suspends without ever being resumed leaves this call waiting
    /// forever, exactly as a handler suspending `while`'s condition would
    /// (§7 `FlowError`) — callers embedding async work should drive it
    /// through the fiber scheduler instead.
    pub fn execute(self: &Arc<Self>, source: &str) -> bool {
        let module_env = ModuleEnv::root();
        let frame = Frame::new_root(Arc::clone(&self.store), module_env);
        self.execute_with_state(source, frame, 1)
    }

    /// Run `source` against an existing frame (§6 `execute_with_state`),
    /// for embedded fragments such as a macro body or a top-level script
    /// sharing a caller-supplied frame.
    ///
    /// A top-level script gets the same phase-3 `~name`/`?name`/`$*`
    /// substitution family a macro body gets (§4.4 phase 3; §8 scenario 1
    /// `echo ~x`), bound to an empty, frame-owned argument list — there is
    /// no enclosing macro invocation to supply real positional args, but
    /// `~`/`?` variable lookups do not need any.
    pub fn execute_with_state(self: &Arc<Self>, source: &str, mut frame: Frame, line_offset: u32) -> bool {
        let seq = crate::command::parse_sequence(source, line_offset);
        let macro_ctx = self.top_level_macro_ctx(&mut frame);
        let (tx, rx) = std::sync::mpsc::channel();
        self.run_sequence_in(
            frame,
            seq,
            Some(macro_ctx),
            Box::new(move |frame, outcome| {
                let status = match outcome {
                    HandlerOutcome::BoolStatus(s) => s,
                    HandlerOutcome::EarlyReturn { status, .. } => status,
                    HandlerOutcome::TokenResult(_) => unreachable!(),
                };
                let _ = tx.send((frame, status));
            }),
        );
        let (mut frame, status) = rx.recv().expect("execute_with_state: sequence never completed");
        frame.release_all();
        status
    }

    /// An empty-args macro substitution context for top-level scripts
    /// (see `execute_with_state`'s doc comment). The backing list is
    /// registered with ref count zero and claimed immediately through
    /// `frame`, so it is released exactly like any other frame-owned
    /// object on `release_all`.
    fn top_level_macro_ctx(&self, frame: &mut Frame) -> crate::substitution::MacroSubstContext {
        let args_list = self.store.register(
            StoredPayload::List { items: Vec::new(), named: Vec::new() },
            ObjectKind::List,
        );
        frame.claim_object(args_list);
        crate::substitution::MacroSubstContext {
            args: Arc::new(Vec::new()),
            named: Arc::new(HashMap::new()),
            args_list,
            template_cache: None,
            call_chain: None,
        }
    }

    /// Run `seq` against `frame`, calling `on_done` with the finished
    /// frame and its terminal outcome — synchronously if every command in
    /// the sequence resolves synchronously, later (from whatever resumes
    /// the suspending token) otherwise.
    pub fn run_sequence(
        self: &Arc<Self>,
        frame: Frame,
        seq: CommandSequence,
        on_done: Box<dyn FnOnce(Frame, HandlerOutcome) + Send>,
    ) {
        self.run_sequence_in(frame, seq, None, on_done);
    }

    /// Like [`Self::run_sequence`], but every substitution performed while
    /// running `seq` carries `macro_ctx` — used to run a macro body so its
    /// `$*`/`$@`/`$N`/`~name` sigils resolve against the invocation's
    /// bound arguments (§4.7 step 4).
    pub(crate) fn run_sequence_in(
        self: &Arc<Self>,
        frame: Frame,
        seq: CommandSequence,
        macro_ctx: Option<crate::substitution::MacroSubstContext>,
        on_done: Box<dyn FnOnce(Frame, HandlerOutcome) + Send>,
    ) {
        let commands = Arc::new(seq.commands);
        self.run_commands_from(frame, commands, 0, macro_ctx, on_done);
    }

    fn run_commands_from(
        self: &Arc<Self>,
        frame: Frame,
        commands: Arc<Vec<(CommandInvocation, Option<Connector>)>>,
        idx: usize,
        macro_ctx: Option<crate::substitution::MacroSubstContext>,
        on_done: Box<dyn FnOnce(Frame, HandlerOutcome) + Send>,
    ) {
        if idx >= commands.len() {
            let status = frame.last_status;
            on_done(frame, HandlerOutcome::BoolStatus(status));
            return;
        }
        let (cmd, connector) = commands[idx].clone();
        let executor = Arc::clone(self);
        let commands2 = Arc::clone(&commands);
        let macro_ctx2 = macro_ctx.clone();
        self.dispatch_command(
            frame,
            cmd,
            macro_ctx,
            Box::new(move |mut frame, outcome| match outcome {
                HandlerOutcome::EarlyReturn { .. } => on_done(frame, outcome),
                HandlerOutcome::BoolStatus(status) => {
                    frame.last_status = status;
                    let go_on = connector.map(|c| c.should_run_next(status)).unwrap_or(true);
                    if go_on {
                        executor.run_commands_from(frame, commands2, idx + 1, macro_ctx2, on_done);
                    } else {
                        on_done(frame, HandlerOutcome::BoolStatus(status));
                    }
                }
                HandlerOutcome::TokenResult(_) => unreachable!("resolved before reaching run_commands_from"),
            }),
        );
    }

    /// Substitute `cmd`'s name and arguments, look up its handler (local →
    /// inherited → fallback), build a `Context`, and invoke it (§4.5 steps
    /// 1-4).
    fn dispatch_command(
        self: &Arc<Self>,
        frame: Frame,
        cmd: CommandInvocation,
        macro_ctx: Option<crate::substitution::MacroSubstContext>,
        on_done: Box<dyn FnOnce(Frame, HandlerOutcome) + Send>,
    ) {
        let executor = Arc::clone(self);
        let position = cmd.position;
        let name_text = cmd.name.clone();
        let raw_args = cmd.args.clone();
        let macro_ctx_for_args = macro_ctx.clone();
        let call_chain = macro_ctx.as_ref().and_then(|c| c.call_chain.clone());

        crate::substitution::substitute(
            self,
            frame,
            name_text,
            crate::substitution::QuoteContext::Outside,
            macro_ctx,
            Box::new(move |frame, name_result| {
                let Ok(name) = name_result else {
                    let mut frame = frame;
                    frame.last_status = false;
                    on_done(frame, HandlerOutcome::BoolStatus(false));
                    return;
                };
                executor.substitute_args(
                    frame,
                    raw_args,
                    0,
                    Vec::new(),
                    macro_ctx_for_args,
                    Box::new(move |frame, args_result| match args_result {
                        Ok(values) => executor.invoke(frame, name, values, position, call_chain, on_done),
                        Err(()) => {
                            let mut frame = frame;
                            frame.last_status = false;
                            on_done(frame, HandlerOutcome::BoolStatus(false));
                        }
                    }),
                );
            }),
        );
    }

    /// Substitute one argument at a time, left to right (§4.5 step 3).
    /// Under `OptimizationLevel::Basic` with a macro's template cache in
    /// scope (§4.4/§6 "Parsed-command cache"), a text already proven to be
    /// a bare literal or a single top-level `{...}` expression skips the
    /// phase-based engine entirely — see `run_single_expression_arg`.
    fn substitute_args(
        self: &Arc<Self>,
        frame: Frame,
        raw_args: Vec<String>,
        idx: usize,
        acc: Vec<(String, Value)>,
        macro_ctx: Option<crate::substitution::MacroSubstContext>,
        on_done: Box<dyn FnOnce(Frame, Result<Vec<(String, Value)>, ()>) + Send>,
    ) {
        if idx >= raw_args.len() {
            on_done(frame, Ok(acc));
            return;
        }
        let text = raw_args[idx].clone();
        let remaining = raw_args.clone();

        if self.optimization_level() == crate::config::OptimizationLevel::Basic {
            if let Some(cache) = macro_ctx.as_ref().and_then(|c| c.template_cache.as_ref()) {
                match cache.classify(&text) {
                    crate::template::Segment::Literal(lit) => {
                        let value = crate::substitution::literal_value(&lit);
                        let mut acc = acc;
                        acc.push((lit, value));
                        self.substitute_args(frame, remaining, idx + 1, acc, macro_ctx, on_done);
                        return;
                    }
                    crate::template::Segment::SingleExpression { content, is_unescape } => {
                        self.run_single_expression_arg(
                            frame, content, is_unescape, acc, remaining, idx, macro_ctx, on_done,
                        );
                        return;
                    }
                    crate::template::Segment::Mixed => {}
                }
            }
        }

        let executor = Arc::clone(self);
        let macro_ctx2 = macro_ctx.clone();
        crate::substitution::substitute(
            self,
            frame,
            text,
            crate::substitution::QuoteContext::Outside,
            macro_ctx,
            Box::new(move |frame, result| match result {
                Ok(substituted) => {
                    let value = crate::substitution::literal_value(&substituted);
                    let mut acc = acc;
                    acc.push((substituted, value));
                    executor.substitute_args(frame, remaining, idx + 1, acc, macro_ctx2, on_done);
                }
                Err(()) => on_done(frame, Err(())),
            }),
        );
    }

    /// Fast path for an argument template that is nothing but a single
    /// top-level `{...}`/`${...}` expression: run its content directly as
    /// a command sequence and hand the resulting [`Value`] straight to the
    /// caller, instead of formatting it to a marker string and re-parsing
    /// that string back through `literal_value` the way
    /// `substitution::substitute_braces` must for the general case. Object
    /// references are still transferred from the child frame to the
    /// parent exactly as the phase-based engine does, so ref-counting
    /// behavior is unchanged — only the string round trip is skipped.
    #[allow(clippy::too_many_arguments)]
    fn run_single_expression_arg(
        self: &Arc<Self>,
        frame: Frame,
        content: String,
        is_unescape: bool,
        acc: Vec<(String, Value)>,
        remaining: Vec<String>,
        idx: usize,
        macro_ctx: Option<crate::substitution::MacroSubstContext>,
        on_done: Box<dyn FnOnce(Frame, Result<Vec<(String, Value)>, ()>) + Send>,
    ) {
        let executor = Arc::clone(self);
        let seq = crate::command::parse_sequence(&content, 1);
        let child = Frame::child_shared_vars(&frame);
        let parent = Arc::new(Mutex::new(Some(frame)));
        let parent_for_cb = Arc::clone(&parent);
        let macro_ctx_for_child = macro_ctx.clone();

        self.run_sequence_in(
            child,
            seq,
            macro_ctx_for_child,
            Box::new(move |mut child_frame, outcome| {
                let (status, explicit_value) = match outcome {
                    HandlerOutcome::BoolStatus(s) => (s, None),
                    HandlerOutcome::EarlyReturn { status, result, has_result } => {
                        (status, if has_result { result } else { None })
                    }
                    HandlerOutcome::TokenResult(_) => {
                        unreachable!("run_sequence resolves tokens before invoking its callback")
                    }
                };
                let value = explicit_value.or_else(|| child_frame.result().cloned()).unwrap_or(Value::Undefined);

                let mut parent_frame = parent_for_cb
                    .lock()
                    .expect("single-expression arg parent frame lock poisoned")
                    .take()
                    .expect("single-expression arg resumed with no parent frame to hand back");
                for r in pawscript_core::extract_refs(&value) {
                    child_frame.transfer_to(&mut parent_frame, r);
                }
                child_frame.release_all();

                if !status {
                    on_done(parent_frame, Err(()));
                    return;
                }

                let raw = crate::substitution::format_brace_value(&executor.store, &value, false, is_unescape);
                let mut acc = acc;
                acc.push((raw, value));
                executor.substitute_args(parent_frame, remaining, idx + 1, acc, macro_ctx, on_done);
            }),
        );
    }

    /// Register a macro definition under `name` (§4.7; §3 "Module
    /// environment"). The macro is stored the same way a builtin command
    /// is — as an `ObjectRef(Command, id)` entry in `module`'s namespace —
    /// so `dispatch_command`'s handler lookup never needs to distinguish
    /// a builtin from a macro invocation.
    pub fn register_macro(&self, module: &ModuleEnv, def: crate::macros::MacroDef) {
        let id = self.next_macro_id.fetch_add(1, Ordering::Relaxed);
        let def = Arc::new(def);
        self.macros.lock().expect("macro registry lock poisoned").insert(id, Arc::clone(&def));
        self.register_command(module, def.name.clone(), crate::macros::MacroHandler { def });
    }

    /// Run a previously-registered macro directly, bypassing command
    /// lookup (§6 `execute_stored_macro`). `parent_state`, if given,
    /// receives the merged `exports` and the transferred result exactly
    /// as an ordinary macro invocation through `dispatch_command` would.
    pub fn execute_stored_macro(
        self: &Arc<Self>,
        macro_ref: &crate::macros::MacroDef,
        args: Vec<Value>,
        named: HashMap<String, Value>,
        parent_state: Option<&mut Frame>,
        position: Option<Position>,
    ) -> (bool, Option<Value>) {
        let def = Arc::new(crate::macros::MacroDef {
            name: macro_ref.name.clone(),
            body: macro_ref.body.clone(),
            module_env: macro_ref.module_env.clone(),
            position: macro_ref.position,
            is_forward: macro_ref.is_forward,
            arg_template_cache: Arc::clone(&macro_ref.arg_template_cache),
        });
        crate::macros::execute_macro(
            self,
            def,
            args,
            named,
            parent_state,
            position.unwrap_or(macro_ref.position),
            None,
        )
    }

    /// Spawn a fiber running `def` (§6 `spawn_fiber`; §4.8 `spawn`).
    pub fn spawn_fiber(
        self: &Arc<Self>,
        def: Arc<crate::macros::MacroDef>,
        args: Vec<Value>,
        named: HashMap<String, Value>,
        parent_module_env: Option<ModuleEnv>,
    ) -> crate::fiber::FiberId {
        self.fibers.spawn(self, def, args, named, parent_module_env)
    }

    /// Block until `id` completes (§6 `wait_for_fiber`; §4.8 `wait`).
    pub fn wait_for_fiber(&self, id: crate::fiber::FiberId) -> Option<crate::fiber::FiberOutcome> {
        self.fibers.wait(id)
    }

    /// Block until every currently-tracked fiber completes (§6
    /// `wait_for_all_fibers`; §4.8 `wait_all`).
    pub fn wait_for_all_fibers(&self) {
        self.fibers.wait_all()
    }

    /// Introspection: fibers currently blocked on a token (§6
    /// `get_suspended_fibers`; §4.8 `get_suspended`).
    pub fn get_suspended_fibers(&self) -> HashMap<crate::fiber::FiberId, TokenId> {
        self.fibers.get_suspended()
    }

    /// Count of fibers not yet completed (§6 `get_fiber_count`).
    pub fn get_fiber_count(&self) -> usize {
        self.fibers.get_fiber_count()
    }

    fn invoke(
        self: &Arc<Self>,
        mut frame: Frame,
        name: String,
        args: Vec<(String, Value)>,
        position: Position,
        macro_chain: Option<Arc<crate::macros::MacroContext>>,
        on_done: Box<dyn FnOnce(Frame, HandlerOutcome) + Send>,
    ) {
        let Some(handler) = self.lookup_handler(&frame.module_env, &name) else {
            self.log(LogLevel::Error, Some(position), &PawError::unknown_command(&name, position).to_string());
            frame.last_status = false;
            on_done(frame, HandlerOutcome::BoolStatus(false));
            return;
        };

        let raw_args: Vec<String> = args.iter().map(|(raw, _)| raw.clone()).collect();
        let values: Vec<Value> = args.into_iter().map(|(_, v)| v).collect();
        let outcome = {
            let mut ctx = Context {
                args: values,
                raw_args,
                named_args: HashMap::new(),
                position,
                frame: &mut frame,
                executor: self,
                macro_chain,
            };
            handler.call(&mut ctx)
        };

        match outcome {
            HandlerOutcome::TokenResult(token_id) => {
                self.tokens.push_command_sequence(
                    token_id,
                    Box::new(move |status| {
                        let mut frame = frame;
                        frame.last_status = status;
                        on_done(frame, HandlerOutcome::BoolStatus(status));
                    }),
                );
            }
            other => on_done(frame, other),
        }
    }
}
