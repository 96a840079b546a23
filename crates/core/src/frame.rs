//! Execution state (C3): the per-invocation frame.
//!
//! One [`Frame`] exists per command, macro, fiber, or isolated brace (§3
//! "Lifecycle: created by the executor per command, macro, fiber, or
//! isolated brace"). The result slot and variable map are first-class
//! ref-counted owners exactly like the teacher's `VariantData` fields are
//! owned array slots rather than linked `next` pointers — nothing here
//! "borrows" a value without the store knowing about it.

use crate::module_env::ModuleEnv;
use crate::store::ObjectStore;
use crate::value::{ObjectKind, ObjectRef, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A cross-fiber signal buffer entry (§3 "Bubble").
#[derive(Debug, Clone)]
pub struct BubbleEntry {
    pub value: Value,
    pub source_fiber: Option<u64>,
}

pub type BubbleMap = Arc<Mutex<HashMap<String, Vec<BubbleEntry>>>>;

/// Walk a [`Value`] for nested object references: a direct `ObjectRef`, or
/// a string holding exactly a marker (§4.3 `extract_refs`).
pub fn extract_refs(value: &Value) -> Vec<ObjectRef> {
    match value {
        Value::ObjectRef(r) => vec![*r],
        Value::Symbol(s) | Value::QuotedString(s) => {
            crate::value::parse_marker(s).map_or_else(Vec::new, |(kind, id)| {
                vec![ObjectRef::new(kind, id)]
            })
        }
        _ => Vec::new(),
    }
}

/// Per-invocation execution state (§3 "Execution state (frame)").
pub struct Frame {
    pub store: Arc<ObjectStore>,
    result: Option<Value>,
    pub last_status: bool,
    variables: Arc<Mutex<HashMap<String, Value>>>,
    pub module_env: ModuleEnv,
    owned_objects: HashMap<ObjectRef, u64>,
    pub in_brace_expression: bool,
    pub bubble_map: BubbleMap,
    pub fiber_id: Option<u64>,
    /// Count of enclosing macro invocations (§4.7); zero for a root frame
    /// or a brace child. Checked by `pawscript-runtime`'s macro handler
    /// against a recursion limit before running a body, to raise a
    /// `MacroError` instead of exhausting the OS thread stack (§7
    /// "too-deep macro recursion").
    pub macro_depth: u32,
    /// The token this frame's own dispatch is running underneath, if any —
    /// e.g. a brace's async content, evaluated while an enclosing brace
    /// coordinator's governing token is still pending. `pawscript-runtime`
    /// reads this as a newly requested token's `parent`, so cancelling the
    /// outer token cascades into whatever this frame's dispatch went on to
    /// request (§4.6 "reparents every async child brace under it"; §5 "a
    /// parent's cleanup cancels all descendant tokens"). Inherited by both
    /// child constructors; a handler granting a frame its own governing
    /// token overwrites it directly.
    pub suspend_parent: Option<u64>,
}

impl Frame {
    /// A brand new root frame (e.g. a top-level `execute` call or a fresh
    /// fiber), with its own variable map and bubble map.
    pub fn new_root(store: Arc<ObjectStore>, module_env: ModuleEnv) -> Self {
        Self {
            store,
            result: None,
            last_status: true,
            variables: Arc::new(Mutex::new(HashMap::new())),
            module_env,
            owned_objects: HashMap::new(),
            in_brace_expression: false,
            bubble_map: Arc::new(Mutex::new(HashMap::new())),
            fiber_id: None,
            macro_depth: 0,
            suspend_parent: None,
        }
    }

    /// A child sharing the parent's variable map and bubble map *by
    /// reference*, with an isolated result slot — used for each brace
    /// evaluation (§4.3 `child_shared_vars`).
    pub fn child_shared_vars(parent: &Frame) -> Self {
        Self {
            store: parent.store.clone(),
            result: None,
            last_status: parent.last_status,
            variables: parent.variables.clone(),
            module_env: parent.module_env.clone(),
            owned_objects: HashMap::new(),
            in_brace_expression: true,
            bubble_map: parent.bubble_map.clone(),
            fiber_id: parent.fiber_id,
            macro_depth: parent.macro_depth,
            suspend_parent: parent.suspend_parent,
        }
    }

    /// A child with a fresh variable map, inheriting the parent's module
    /// environment — used for macro invocation (§4.3 `child_fresh`).
    pub fn child_fresh(parent: &Frame) -> Self {
        Self {
            store: parent.store.clone(),
            result: None,
            last_status: true,
            variables: Arc::new(Mutex::new(HashMap::new())),
            module_env: parent.module_env.child(),
            owned_objects: HashMap::new(),
            in_brace_expression: false,
            bubble_map: parent.bubble_map.clone(),
            fiber_id: parent.fiber_id,
            macro_depth: parent.macro_depth + 1,
            suspend_parent: parent.suspend_parent,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Claim every ref in `new`, release every ref in the old result, then
    /// store `new`. Writing the bare `Undefined` sentinel clears the
    /// result. The result slot owns references just like a variable
    /// (§4.3 `set_result`).
    pub fn set_result(&mut self, new: Value) {
        let old = self.result.take();
        if let Some(old) = &old {
            for r in extract_refs(old) {
                self.release_object(r);
            }
        }
        if matches!(new, Value::Undefined) {
            self.result = None;
            return;
        }
        for r in extract_refs(&new) {
            self.claim_object(r);
        }
        self.result = Some(new);
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables
            .lock()
            .expect("frame variable map lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn set_variable(&mut self, name: impl Into<String>, new: Value) {
        let name = name.into();
        let old = {
            let mut vars = self
                .variables
                .lock()
                .expect("frame variable map lock poisoned");
            vars.insert(name, new.clone())
        };
        if let Some(old) = old {
            for r in extract_refs(&old) {
                self.release_object(r);
            }
        }
        for r in extract_refs(&new) {
            self.claim_object(r);
        }
    }

    pub fn delete_variable(&mut self, name: &str) {
        let old = {
            let mut vars = self
                .variables
                .lock()
                .expect("frame variable map lock poisoned");
            vars.remove(name)
        };
        if let Some(old) = old {
            for r in extract_refs(&old) {
                self.release_object(r);
            }
        }
    }

    /// Claim a reference through this frame, recording it in the frame's
    /// owned-objects multiset so `release_all` can give it back exactly
    /// once per claim (§3 invariant).
    pub fn claim_object(&mut self, obj_ref: ObjectRef) {
        if self.store.claim(obj_ref) {
            *self.owned_objects.entry(obj_ref).or_insert(0) += 1;
        }
    }

    pub fn release_object(&mut self, obj_ref: ObjectRef) {
        if let Some(count) = self.owned_objects.get_mut(&obj_ref) {
            *count -= 1;
            if *count == 0 {
                self.owned_objects.remove(&obj_ref);
            }
        }
        self.store.release(obj_ref);
    }

    pub fn claimed_count(&self, kind: ObjectKind, id: u64) -> u64 {
        self.owned_objects
            .get(&ObjectRef::new(kind, id))
            .copied()
            .unwrap_or(0)
    }

    /// Release every reference this frame still owns — variables, the
    /// result slot, and anything claimed directly — exactly once each.
    /// Called on normal completion or cancellation (§3 "Lifecycle").
    pub fn release_all(&mut self) {
        if let Some(result) = self.result.take() {
            for r in extract_refs(&result) {
                self.release_object(r);
            }
        }
        let vars = std::mem::take(
            &mut *self
                .variables
                .lock()
                .expect("frame variable map lock poisoned"),
        );
        for (_, v) in vars {
            for r in extract_refs(&v) {
                self.release_object(r);
            }
        }
        let remaining: Vec<ObjectRef> = self.owned_objects.keys().copied().collect();
        for r in remaining {
            let count = self.owned_objects.get(&r).copied().unwrap_or(0);
            for _ in 0..count {
                self.release_object(r);
            }
        }
    }

    /// Transfer ownership of `obj_ref` from this (child) frame to
    /// `parent`, used when a brace child frame hands its acquired objects
    /// back up (§4.4 brace substitution step).
    pub fn transfer_to(&mut self, parent: &mut Frame, obj_ref: ObjectRef) {
        if let Some(count) = self.owned_objects.remove(&obj_ref) {
            *parent.owned_objects.entry(obj_ref).or_insert(0) += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoredPayload;

    fn fresh_frame() -> Frame {
        Frame::new_root(Arc::new(ObjectStore::new()), ModuleEnv::root())
    }

    #[test]
    fn set_result_claims_new_and_releases_old() {
        let mut frame = fresh_frame();
        let list_ref = frame.store.register(
            StoredPayload::List {
                items: vec![],
                named: vec![],
            },
            ObjectKind::List,
        );
        frame.set_result(Value::ObjectRef(list_ref));
        assert_eq!(frame.store.ref_count(list_ref), Some(1));
        frame.set_result(Value::Undefined);
        assert_eq!(frame.store.ref_count(list_ref), None);
        assert!(frame.result().is_none());
    }

    #[test]
    fn release_all_drops_owned_objects_to_zero() {
        let mut frame = fresh_frame();
        let list_ref = frame
            .store
            .register(StoredPayload::Bytes(vec![1, 2, 3]), ObjectKind::Bytes);
        frame.set_variable("x", Value::ObjectRef(list_ref));
        assert_eq!(frame.store.ref_count(list_ref), Some(1));
        frame.release_all();
        assert_eq!(frame.store.ref_count(list_ref), None);
    }

    #[test]
    fn child_shared_vars_sees_parent_writes() {
        let mut parent = fresh_frame();
        parent.set_variable("x", Value::Int64(5));
        let child = Frame::child_shared_vars(&parent);
        assert_eq!(child.get_variable("x"), Some(Value::Int64(5)));
        assert!(child.in_brace_expression);
    }

    #[test]
    fn child_fresh_does_not_see_parent_variables() {
        let mut parent = fresh_frame();
        parent.set_variable("x", Value::Int64(5));
        let child = Frame::child_fresh(&parent);
        assert_eq!(child.get_variable("x"), None);
    }

    #[test]
    fn double_variable_write_releases_previous_value() {
        let mut frame = fresh_frame();
        let a = frame
            .store
            .register(StoredPayload::Bytes(vec![]), ObjectKind::Bytes);
        let b = frame
            .store
            .register(StoredPayload::Bytes(vec![]), ObjectKind::Bytes);
        frame.set_variable("x", Value::ObjectRef(a));
        frame.set_variable("x", Value::ObjectRef(b));
        assert_eq!(frame.store.ref_count(a), None, "old value must be released");
        assert_eq!(frame.store.ref_count(b), Some(1));
    }
}
