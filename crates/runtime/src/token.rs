//! Completion tokens (C6): suspend a command sequence or a brace
//! substitution, then resume it once the asynchronous work underneath
//! completes.
//!
//! Grounded on the teacher's `channel.rs` registry shape — an
//! `AtomicU64` id generator guarding a `Mutex<HashMap<id, Entry>>` — and
//! on `watchdog.rs`'s "dedicated background thread, not a coroutine" rule
//! for anything that must keep running even if every fiber is stuck: each
//! token's cancellation deadline is enforced by its own timer thread
//! rather than a scheduled coroutine, since a wedged scheduler must not
//! prevent timeouts from firing.

use pawscript_core::Position;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type TokenId = u64;

/// Run once, outside any token-table lock, when a token is removed
/// (§4.2's "release never recurses under the lock" discipline applied to
/// tokens instead of store objects).
pub type CleanupFn = Box<dyn FnOnce() + Send>;

/// The unexecuted remainder of a command sequence, captured at the point
/// a handler suspended (§4.5 step 5, `push_command_sequence`). Invoked
/// with the (possibly inverted) resume status.
pub type ContinuationFn = Box<dyn FnOnce(bool) + Send>;

/// Delivered to a fiber blocked on a token via [`TokenTable::attach_wait_channel`]
/// (§3 "Fiber", §4.8).
#[derive(Debug, Clone)]
pub struct ResumeData {
    pub token_id: TokenId,
    pub status: bool,
    pub result: Option<pawscript_core::Value>,
}

struct PendingSequence {
    continuation: ContinuationFn,
}

struct TokenEntry {
    parent_id: Option<TokenId>,
    children: Vec<TokenId>,
    cleanup: Option<CleanupFn>,
    cancel_deadline: Instant,
    pending_sequence: Option<PendingSequence>,
    chained_token: Option<TokenId>,
    invert_status: bool,
    position: Position,
    wait_sender: Option<may::sync::mpmc::Sender<ResumeData>>,
}

/// One brace awaiting evaluation inside a [`BraceCoordinator`] (§3 "Brace
/// coordinator").
struct BraceSlot {
    start: usize,
    end: usize,
    result: Option<String>,
}

struct BraceCoordinator {
    slots: Vec<BraceSlot>,
    completed_count: usize,
    has_failure: bool,
    original_text: String,
    resume_callback: Option<Box<dyn FnOnce(Result<String, ()>) + Send>>,
}

impl BraceCoordinator {
    fn total(&self) -> usize {
        self.slots.len()
    }

    fn is_terminal(&self) -> bool {
        self.completed_count == self.total()
    }

    /// Splice all completed results into `original_text`, position
    /// descending, so earlier replacements never shift later offsets
    /// (§4.6 "Ordering": exactly once, after the final completion,
    /// position-descending to avoid index shifts).
    fn splice(&self) -> String {
        let mut text = self.original_text.clone();
        let mut slots: Vec<&BraceSlot> = self.slots.iter().collect();
        slots.sort_by(|a, b| b.start.cmp(&a.start));
        for slot in slots {
            if let Some(result) = &slot.result {
                text.replace_range(slot.start..slot.end, result);
            }
        }
        text
    }
}

struct Inner {
    tokens: HashMap<TokenId, TokenEntry>,
    coordinators: HashMap<TokenId, BraceCoordinator>,
}

/// The token forest (§3 "Token", §4.6). One instance per [`crate::executor::Executor`].
pub struct TokenTable {
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl Default for TokenTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                tokens: HashMap::new(),
                coordinators: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("token table lock poisoned: a prior resume/cleanup panicked while holding it")
    }

    /// Allocate a token and bind its cancellation deadline (§4.6
    /// `request_token`). `self` must be held behind an `Arc` so the
    /// deadline timer thread can reach back into the table.
    pub fn request_token(
        self: &Arc<Self>,
        cleanup: Option<CleanupFn>,
        parent: Option<TokenId>,
        timeout: Duration,
        position: Position,
        invert_status: bool,
    ) -> TokenId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut guard = self.lock();
            guard.tokens.insert(
                id,
                TokenEntry {
                    parent_id: parent,
                    children: Vec::new(),
                    cleanup,
                    cancel_deadline: Instant::now() + timeout,
                    pending_sequence: None,
                    chained_token: None,
                    invert_status,
                    position,
                    wait_sender: None,
                },
            );
            if let Some(parent_id) = parent {
                if let Some(parent_entry) = guard.tokens.get_mut(&parent_id) {
                    parent_entry.children.push(id);
                }
            }
        }

        let table = Arc::clone(self);
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            if table.deadline_still_pending(id) {
                table.force_cleanup(id);
            }
        });

        id
    }

    fn deadline_still_pending(&self, id: TokenId) -> bool {
        self.lock()
            .tokens
            .get(&id)
            .map(|e| e.cancel_deadline <= Instant::now())
            .unwrap_or(false)
    }

    /// Create a coordinator awaiting `spans` (byte ranges in
    /// `original_text`, each with its result if already known
    /// synchronously, or `None` if it is still pending an async token)
    /// (§4.6 `request_brace_coordinator`). Pre-known (synchronous) slots
    /// count toward `completed_count` immediately; only the `None` slots
    /// wait on a later [`TokenTable::resume`].
    pub fn request_brace_coordinator(
        &self,
        spans: Vec<(usize, usize, Option<String>)>,
        original_text: String,
        resume_callback: Box<dyn FnOnce(Result<String, ()>) + Send>,
    ) -> TokenId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let completed_count = spans.iter().filter(|(_, _, r)| r.is_some()).count();
        let slots = spans
            .into_iter()
            .map(|(start, end, result)| BraceSlot { start, end, result })
            .collect::<Vec<_>>();
        let total = slots.len();
        let mut guard = self.lock();
        guard.coordinators.insert(
            id,
            BraceCoordinator {
                slots,
                completed_count,
                has_failure: false,
                original_text,
                resume_callback: Some(resume_callback),
            },
        );
        drop(guard);
        if completed_count == total {
            // Everything was already known synchronously (including the
            // degenerate empty-spans case): resolve immediately rather
            // than waiting for a resume that will never come.
            self.complete_coordinator(id);
        }
        id
    }

    /// Attach the continuation to run once `id` resumes (§4.5 step 5,
    /// `push_command_sequence`).
    pub fn push_command_sequence(&self, id: TokenId, continuation: ContinuationFn) {
        let mut guard = self.lock();
        if let Some(entry) = guard.tokens.get_mut(&id) {
            entry.pending_sequence = Some(PendingSequence { continuation });
        }
    }

    /// Chain `next` to resume immediately after `id` resumes (§4.6
    /// "chained tokens resume in order").
    pub fn chain(&self, id: TokenId, next: TokenId) {
        let mut guard = self.lock();
        if let Some(entry) = guard.tokens.get_mut(&id) {
            entry.chained_token = Some(next);
        }
    }

    /// Register a channel a fiber is blocked on, to be notified at resume
    /// time instead of / in addition to running a continuation (§4.8).
    pub fn attach_wait_channel(&self, id: TokenId, sender: may::sync::mpmc::Sender<ResumeData>) {
        let mut guard = self.lock();
        if let Some(entry) = guard.tokens.get_mut(&id) {
            entry.wait_sender = Some(sender);
        }
    }

    /// Resume `id` with `status`, inverted if the token's `invert_status`
    /// flag is set: runs the pending continuation, removes the token, then
    /// resumes any chained token (§4.6 `resume`).
    pub fn resume(&self, id: TokenId, status: bool, result: Option<pawscript_core::Value>) {
        let (effective_status, pending, chained, wait_sender) = {
            let mut guard = self.lock();
            let Some(entry) = guard.tokens.remove(&id) else {
                return;
            };
            let effective = if entry.invert_status {
                !status
            } else {
                status
            };
            (effective, entry.pending_sequence, entry.chained_token, entry.wait_sender)
        };

        if let Some(sender) = wait_sender {
            let _ = sender.send(ResumeData {
                token_id: id,
                status: effective_status,
                result,
            });
        }

        if let Some(pending) = pending {
            (pending.continuation)(effective_status);
        }

        if let Some(next) = chained {
            self.resume(next, effective_status, None);
        }
    }

    /// Record a result into `coordinator_id`'s `slot_index` slot, and
    /// complete the coordinator once every slot has one.
    pub(crate) fn report_brace_result(
        &self,
        coordinator_id: TokenId,
        slot_index: usize,
        formatted: Option<String>,
        failed: bool,
    ) {
        let finished = {
            let mut guard = self.lock();
            let Some(coord) = guard.coordinators.get_mut(&coordinator_id) else {
                return;
            };
            if let Some(slot) = coord.slots.get_mut(slot_index) {
                if slot.result.is_none() {
                    slot.result = Some(formatted.unwrap_or_default());
                    coord.completed_count += 1;
                }
            }
            coord.has_failure |= failed;
            coord.is_terminal()
        };
        if finished {
            self.complete_coordinator(coordinator_id);
        }
    }

    /// Resolve `coordinator_id` with `Err(())` if it is still pending,
    /// without touching any slot — used when the coordinator's own
    /// governing token is cascade-cancelled (§5 "a parent's cleanup
    /// cancels all descendant tokens") and so will never see every span
    /// report on its own. A no-op if the coordinator already completed
    /// normally, since [`Self::complete_coordinator`] removes it first.
    pub(crate) fn fail_coordinator(&self, coordinator_id: TokenId) {
        let callback = {
            let mut guard = self.lock();
            guard
                .coordinators
                .remove(&coordinator_id)
                .and_then(|mut c| c.resume_callback.take())
        };
        if let Some(callback) = callback {
            callback(Err(()));
        }
    }

    fn complete_coordinator(&self, coordinator_id: TokenId) {
        let (callback, outcome) = {
            let mut guard = self.lock();
            let Some(mut coord) = guard.coordinators.remove(&coordinator_id) else {
                return;
            };
            let callback = coord.resume_callback.take();
            let outcome = if coord.has_failure {
                Err(())
            } else {
                Ok(coord.splice())
            };
            (callback, outcome)
        };
        if let Some(callback) = callback {
            callback(outcome);
        }
    }

    /// Invoke cleanup, cancel the timer (by letting it observe the token
    /// is already gone), recursively clean children, then remove the
    /// token. Idempotent: calling twice on an already-removed token is a
    /// no-op (§4.6 "Cancellation must be idempotent").
    pub fn force_cleanup(&self, id: TokenId) {
        let (cleanup, children) = {
            let mut guard = self.lock();
            let Some(entry) = guard.tokens.remove(&id) else {
                return;
            };
            (entry.cleanup, entry.children)
        };
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        for child in children {
            self.force_cleanup(child);
        }
    }

    pub fn is_open(&self, id: TokenId) -> bool {
        self.lock().tokens.contains_key(&id)
    }

    pub fn open_token_count(&self) -> usize {
        self.lock().tokens.len()
    }

    pub fn open_coordinator_count(&self) -> usize {
        self.lock().coordinators.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn resume_runs_continuation_and_removes_token() {
        let table = Arc::new(TokenTable::new());
        let id = table.request_token(None, None, Duration::from_secs(60), Position::new(1, 1), false);
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        table.push_command_sequence(
            id,
            Box::new(move |status| {
                assert!(status);
                ran_clone.store(true, Ordering::SeqCst);
            }),
        );
        table.resume(id, true, None);
        assert!(ran.load(Ordering::SeqCst));
        assert!(!table.is_open(id));
    }

    #[test]
    fn invert_status_flips_resume_value() {
        let table = Arc::new(TokenTable::new());
        let id = table.request_token(None, None, Duration::from_secs(60), Position::new(1, 1), true);
        let seen = Arc::new(AtomicBool::new(true));
        let seen_clone = seen.clone();
        table.push_command_sequence(
            id,
            Box::new(move |status| {
                seen_clone.store(status, Ordering::SeqCst);
            }),
        );
        table.resume(id, true, None);
        assert!(!seen.load(Ordering::SeqCst), "status should have been inverted");
    }

    #[test]
    fn force_cleanup_is_idempotent() {
        let table = Arc::new(TokenTable::new());
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_clone = calls.clone();
        let id = table.request_token(
            Some(Box::new(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })),
            None,
            Duration::from_secs(60),
            Position::new(1, 1),
            false,
        );
        table.force_cleanup(id);
        table.force_cleanup(id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn force_cleanup_recurses_into_children_before_parent_removed() {
        let table = Arc::new(TokenTable::new());
        let parent = table.request_token(None, None, Duration::from_secs(60), Position::new(1, 1), false);
        let child = table.request_token(None, Some(parent), Duration::from_secs(60), Position::new(1, 1), false);
        table.force_cleanup(parent);
        assert!(!table.is_open(parent));
        assert!(!table.is_open(child));
    }

    #[test]
    fn brace_coordinator_splices_in_position_descending_order() {
        let table = TokenTable::new();
        let original = "echo {a}-{b}".to_string();
        let a_start = original.find("{a}").unwrap();
        let b_start = original.find("{b}").unwrap();
        let spliced = Arc::new(Mutex::new(None));
        let spliced_clone = spliced.clone();
        let coord_id = table.request_brace_coordinator(
            vec![(a_start, a_start + 3, None), (b_start, b_start + 3, None)],
            original,
            Box::new(move |result| {
                *spliced_clone.lock().unwrap() = Some(result);
            }),
        );
        table.report_brace_result(coord_id, 0, Some("AAA".to_string()), false);
        table.report_brace_result(coord_id, 1, Some("BBB".to_string()), false);
        let result = spliced.lock().unwrap().take().unwrap();
        assert_eq!(result, Ok("echo AAA-BBB".to_string()));
    }

    #[test]
    fn coordinator_with_failure_reports_err() {
        let table = TokenTable::new();
        let result = Arc::new(Mutex::new(None));
        let result_clone = result.clone();
        let coord_id = table.request_brace_coordinator(
            vec![(0, 1, None)],
            "x".to_string(),
            Box::new(move |r| *result_clone.lock().unwrap() = Some(r)),
        );
        table.report_brace_result(coord_id, 0, None, true);
        assert_eq!(*result.lock().unwrap(), Some(Err(())));
    }
}
