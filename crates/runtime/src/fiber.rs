//! Fiber scheduler (C8): cooperative, `may`-backed concurrent tasks that
//! each run one macro invocation to completion (§4.8).
//!
//! Grounded on the teacher's `scheduler.rs` strand bookkeeping — a
//! lock-free active counter for the hot path (spawn/complete) plus a
//! `Condvar`-based shutdown wait for the cold path (`wait_all`) — adapted
//! from "wait for every strand" to "wait for one specific fiber, or
//! all of them," since callers here hold onto a `FiberId` instead of
//! firing-and-forgetting like the teacher's FFI strand API.
//!
//! **Open question resolved** (see `DESIGN.md`): [`crate::macros::execute_macro`]
//! already blocks its calling thread until the body finishes, so from this
//! module's perspective a fiber's task body never actually observes an
//! intermediate suspended state — `get_suspended` is therefore best-effort
//! and will report a fiber only during the narrow window the body is
//! executing, never mid-token-wait.

use crate::executor::Executor;
use crate::macros::MacroDef;
use pawscript_core::{extract_refs, ModuleEnv, ObjectStore, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::SystemTime;

pub type FiberId = u64;

/// What a finished fiber produced (§4.8 `wait`).
#[derive(Debug, Clone)]
pub struct FiberOutcome {
    pub status: bool,
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Running,
    Completed,
}

struct FiberSlotInner {
    state: FiberState,
    outcome: Option<FiberOutcome>,
    suspended_on: Option<crate::token::TokenId>,
    started_at: SystemTime,
}

struct FiberSlot {
    inner: Mutex<FiberSlotInner>,
    condvar: Condvar,
}

/// The fiber registry (§3 "Fiber"). One instance per [`Executor`].
/// Completed slots are kept (not removed) so a late `wait()` can still
/// retrieve the outcome — unlike the teacher's strand counter, which only
/// tracks liveness, this table is also the result mailbox.
pub struct FiberTable {
    next_id: AtomicU64,
    slots: Mutex<HashMap<FiberId, Arc<FiberSlot>>>,
    active_count: AtomicUsize,
    shutdown_condvar: Condvar,
    shutdown_mutex: Mutex<()>,
}

impl Default for FiberTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
            shutdown_condvar: Condvar::new(),
            shutdown_mutex: Mutex::new(()),
        }
    }

    /// Spawn a cooperative task running `def` against `args`/`named`
    /// (§4.8 `spawn`). References in `args` are claimed *before* the task
    /// starts, so a parent releasing its own copy immediately after
    /// spawning cannot race the task's first read of them.
    pub fn spawn(
        self: &Arc<Self>,
        executor: &Arc<Executor>,
        def: Arc<MacroDef>,
        args: Vec<Value>,
        named: HashMap<String, Value>,
        parent_module_env: Option<ModuleEnv>,
    ) -> FiberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).max(1);
        claim_all(&executor.store, &args);
        claim_all(&executor.store, &named.values().cloned().collect::<Vec<_>>());

        let slot = Arc::new(FiberSlot {
            inner: Mutex::new(FiberSlotInner {
                state: FiberState::Running,
                outcome: None,
                suspended_on: None,
                started_at: SystemTime::now(),
            }),
            condvar: Condvar::new(),
        });
        self.slots.lock().expect("fiber table lock poisoned").insert(id, Arc::clone(&slot));
        self.active_count.fetch_add(1, Ordering::Release);

        let table = Arc::clone(self);
        let executor = Arc::clone(executor);
        let module_env = parent_module_env.unwrap_or_else(|| def.module_env.child());

        may::coroutine::spawn(move || {
            let mut frame = pawscript_core::Frame::new_root(Arc::clone(&executor.store), module_env);
            frame.fiber_id = Some(id);
            let (status, result) = crate::macros::execute_macro(
                &executor,
                def,
                args.clone(),
                named.clone(),
                Some(&mut frame),
                def_position_fallback(),
                None,
            );

            // Move any unread bubbles into the executor's orphan pool,
            // claiming their content refs first so they survive this
            // frame's release_all below (§3 "claiming their content refs
            // so they survive").
            let leftover: HashMap<_, _> = {
                let mut bubbles = frame.bubble_map.lock().expect("fiber bubble map lock poisoned");
                bubbles.drain().collect()
            };
            for entries in leftover.values() {
                for entry in entries {
                    for r in extract_refs(&entry.value) {
                        executor.store.claim(r);
                    }
                }
            }
            executor.deposit_orphan_bubbles(leftover);

            release_all(&executor.store, &args);
            release_all(&executor.store, &named.values().cloned().collect::<Vec<_>>());
            frame.release_all();

            {
                let mut guard = slot.inner.lock().expect("fiber slot lock poisoned");
                guard.state = FiberState::Completed;
                guard.outcome = Some(FiberOutcome { status, result });
                guard.suspended_on = None;
            }
            slot.condvar.notify_all();

            let prev = table.active_count.fetch_sub(1, Ordering::AcqRel);
            if prev == 1 {
                let _guard = table.shutdown_mutex.lock().expect("fiber shutdown mutex poisoned");
                table.shutdown_condvar.notify_all();
            }
        });

        id
    }

    /// Block until fiber `id` completes and return its outcome (§4.8
    /// `wait`). Returns `None` for an id that was never spawned.
    pub fn wait(&self, id: FiberId) -> Option<FiberOutcome> {
        let slot = self.slots.lock().expect("fiber table lock poisoned").get(&id).cloned()?;
        let guard = slot.inner.lock().expect("fiber slot lock poisoned");
        let guard = self
            .shutdown_wait_until(guard, &slot.condvar, |g| g.state == FiberState::Completed)
            .ok()?;
        guard.outcome.clone()
    }

    fn shutdown_wait_until<'a>(
        &self,
        mut guard: std::sync::MutexGuard<'a, FiberSlotInner>,
        condvar: &Condvar,
        mut done: impl FnMut(&FiberSlotInner) -> bool,
    ) -> Result<std::sync::MutexGuard<'a, FiberSlotInner>, ()> {
        while !done(&guard) {
            guard = condvar.wait(guard).map_err(|_| ())?;
        }
        Ok(guard)
    }

    /// Block until every currently-tracked fiber has completed (§4.8
    /// `wait_all`).
    pub fn wait_all(&self) {
        let guard = self.shutdown_mutex.lock().expect("fiber shutdown mutex poisoned");
        let _guard = self
            .shutdown_condvar
            .wait_while(guard, |_| self.active_count.load(Ordering::Acquire) > 0)
            .expect("fiber shutdown condvar wait failed");
    }

    /// Best-effort introspection (§4.8 `get_suspended`); see module docs
    /// for why this is necessarily incomplete under the current
    /// synchronous-macro-body design.
    pub fn get_suspended(&self) -> HashMap<FiberId, crate::token::TokenId> {
        self.slots
            .lock()
            .expect("fiber table lock poisoned")
            .iter()
            .filter_map(|(id, slot)| {
                let guard = slot.inner.lock().expect("fiber slot lock poisoned");
                guard.suspended_on.map(|token| (*id, token))
            })
            .collect()
    }

    /// Count of fibers not yet completed.
    pub fn get_fiber_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    /// Snapshot of every still-running fiber's start time, for the
    /// watchdog (§6 ADD `install_watchdog`) to compare against its
    /// threshold. Never blocks on a slot longer than a single field read.
    pub fn running_since(&self) -> Vec<(FiberId, SystemTime)> {
        self.slots
            .lock()
            .expect("fiber table lock poisoned")
            .iter()
            .filter_map(|(id, slot)| {
                let guard = slot.inner.lock().expect("fiber slot lock poisoned");
                (guard.state == FiberState::Running).then_some((*id, guard.started_at))
            })
            .collect()
    }
}

fn def_position_fallback() -> pawscript_core::Position {
    pawscript_core::Position::new(1, 1)
}

fn claim_all(store: &ObjectStore, values: &[Value]) {
    for v in values {
        for r in extract_refs(v) {
            store.claim(r);
        }
    }
}

fn release_all(store: &ObjectStore, values: &[Value]) {
    for v in values {
        for r in extract_refs(v) {
            store.release(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Context, HandlerOutcome};
    use crate::logger::StderrLogger;
    use pawscript_core::{BubbleEntry, Position};
    use std::time::Duration;

    fn test_executor() -> Arc<Executor> {
        Executor::new(Arc::new(StderrLogger))
    }

    #[test]
    fn spawn_and_wait_returns_macro_result() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        executor.register_command(&module, "five", |ctx: &mut Context<'_>| {
            ctx.frame.set_result(Value::Int64(5));
            HandlerOutcome::BoolStatus(true)
        });
        let def = Arc::new(MacroDef::new("get_five", "five", module.clone(), Position::new(1, 1)));
        let id = executor.fibers.spawn(&executor, def, vec![], HashMap::new(), Some(module));
        let outcome = executor.fibers.wait(id).expect("fiber never completed");
        assert!(outcome.status);
        assert_eq!(outcome.result, Some(Value::Int64(5)));
    }

    #[test]
    fn wait_on_unknown_fiber_returns_none() {
        let executor = test_executor();
        assert!(executor.fibers.wait(9999).is_none());
    }

    #[test]
    fn wait_all_blocks_until_every_fiber_completes() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        executor.register_command(&module, "noop", |_ctx: &mut Context<'_>| HandlerOutcome::BoolStatus(true));
        let def = Arc::new(MacroDef::new("noop_macro", "noop", module.clone(), Position::new(1, 1)));
        for _ in 0..3 {
            executor.fibers.spawn(&executor, Arc::clone(&def), vec![], HashMap::new(), Some(module.clone()));
        }
        executor.fibers.wait_all();
        assert_eq!(executor.fibers.get_fiber_count(), 0);
    }

    #[test]
    fn fiber_count_drops_to_zero_after_completion() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        executor.register_command(&module, "noop", |_ctx: &mut Context<'_>| HandlerOutcome::BoolStatus(true));
        let def = Arc::new(MacroDef::new("noop_macro", "noop", module.clone(), Position::new(1, 1)));
        let id = executor.fibers.spawn(&executor, def, vec![], HashMap::new(), Some(module));
        assert!(executor.fibers.wait(id).is_some());
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(executor.fibers.get_fiber_count(), 0);
    }

    #[test]
    fn unread_bubbles_migrate_to_executor_orphan_pool() {
        let executor = test_executor();
        let module = ModuleEnv::root();
        executor.register_command(&module, "leave_bubble", |ctx: &mut Context<'_>| {
            ctx.frame
                .bubble_map
                .lock()
                .expect("bubble map lock poisoned")
                .entry("signal".to_string())
                .or_default()
                .push(BubbleEntry {
                    value: Value::Int64(42),
                    source_fiber: ctx.frame.fiber_id,
                });
            HandlerOutcome::BoolStatus(true)
        });
        let def = Arc::new(MacroDef::new("drop_bubble", "leave_bubble", module.clone(), Position::new(1, 1)));
        let id = executor.fibers.spawn(&executor, def, vec![], HashMap::new(), Some(module));
        assert!(executor.fibers.wait(id).is_some());

        let orphaned = executor.take_orphan_bubbles("signal");
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].value, Value::Int64(42));
        assert_eq!(orphaned[0].source_fiber, Some(id));

        // Draining is destructive: a second take for the same flavor is empty.
        assert!(executor.take_orphan_bubbles("signal").is_empty());
    }
}
