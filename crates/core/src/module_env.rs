//! Module environment (§3 "Module environment"): the split
//! `(module_local, inherited)` namespace for commands, macros, and named
//! objects.
//!
//! Commands and macros are stored as [`ObjectRef`]s into the object store
//! rather than as concrete handler/closure types, so this crate never
//! needs to know the shape of a `Handler` or `MacroDef` (those live in
//! `pawscript-runtime`, C5/C7). This is the same "prefer `ObjectRef`, keep
//! markers at the boundary" discipline described in §9 Design Notes,
//! applied to the registries instead of just to values.

use crate::value::{ObjectRef, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One namespace level: commands/macros keyed by name, named objects
/// keyed by `#name`, and the `export` accumulator used by macro bodies
/// (C7 step 2: `module_env.default_name = "exports"`).
#[derive(Debug, Default)]
pub struct Namespace {
    pub commands: HashMap<String, ObjectRef>,
    pub macros: HashMap<String, ObjectRef>,
    pub objects: HashMap<String, Value>,
    pub exports: HashMap<String, Value>,
}

/// Ordered pair of namespaces: local lookups win, then inherited, then the
/// caller's fallback handler (§4.5 step 2). Read-mostly, so it is shared
/// behind an `Arc<RwLock<_>>` the way the teacher's command registry is a
/// reader-writer-locked, read-mostly structure (§5 "command registry is
/// read-mostly (reader lock)").
#[derive(Debug, Clone)]
pub struct ModuleEnv {
    pub local: Arc<RwLock<Namespace>>,
    pub inherited: Option<Arc<RwLock<Namespace>>>,
}

impl ModuleEnv {
    pub fn root() -> Self {
        Self {
            local: Arc::new(RwLock::new(Namespace::default())),
            inherited: None,
        }
    }

    /// A child environment for a macro/fiber invocation: fresh local
    /// namespace, inheriting from this one (§3 "Lifecycle is per
    /// macro/fiber").
    pub fn child(&self) -> Self {
        Self {
            local: Arc::new(RwLock::new(Namespace::default())),
            inherited: Some(self.local.clone()),
        }
    }

    fn read_lock(ns: &Arc<RwLock<Namespace>>) -> std::sync::RwLockReadGuard<'_, Namespace> {
        ns.read()
            .expect("module namespace lock poisoned: a writer panicked while holding it")
    }

    pub fn lookup_command(&self, name: &str) -> Option<ObjectRef> {
        if let Some(r) = Self::read_lock(&self.local).commands.get(name).copied() {
            return Some(r);
        }
        self.inherited
            .as_ref()
            .and_then(|ns| Self::read_lock(ns).commands.get(name).copied())
    }

    pub fn lookup_macro(&self, name: &str) -> Option<ObjectRef> {
        if let Some(r) = Self::read_lock(&self.local).macros.get(name).copied() {
            return Some(r);
        }
        self.inherited
            .as_ref()
            .and_then(|ns| Self::read_lock(ns).macros.get(name).copied())
    }

    pub fn lookup_object(&self, name: &str) -> Option<Value> {
        if let Some(v) = Self::read_lock(&self.local).objects.get(name).cloned() {
            return Some(v);
        }
        self.inherited
            .as_ref()
            .and_then(|ns| Self::read_lock(ns).objects.get(name).cloned())
    }

    pub fn register_command(&self, name: impl Into<String>, handler: ObjectRef) {
        self.local
            .write()
            .expect("module namespace lock poisoned")
            .commands
            .insert(name.into(), handler);
    }

    pub fn register_macro(&self, name: impl Into<String>, macro_ref: ObjectRef) {
        self.local
            .write()
            .expect("module namespace lock poisoned")
            .macros
            .insert(name.into(), macro_ref);
    }

    pub fn register_object(&self, name: impl Into<String>, value: Value) {
        self.local
            .write()
            .expect("module namespace lock poisoned")
            .objects
            .insert(name.into(), value);
    }

    pub fn add_export(&self, name: impl Into<String>, value: Value) {
        self.local
            .write()
            .expect("module namespace lock poisoned")
            .exports
            .insert(name.into(), value);
    }

    pub fn take_exports(&self) -> HashMap<String, Value> {
        std::mem::take(
            &mut self
                .local
                .write()
                .expect("module namespace lock poisoned")
                .exports,
        )
    }

    /// Merge a completed macro body's `exports` into this environment's
    /// inherited-exports slot (C7 step 5). Parent environments receive
    /// exported names as ordinary local objects.
    pub fn merge_exports(&self, exports: HashMap<String, Value>) {
        let mut guard = self.local.write().expect("module namespace lock poisoned");
        for (name, value) in exports {
            guard.objects.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ObjectKind;

    #[test]
    fn child_inherits_parent_lookups() {
        let root = ModuleEnv::root();
        root.register_object("greeting", Value::QuotedString("hi".into()));
        let child = root.child();
        assert_eq!(
            child.lookup_object("greeting"),
            Some(Value::QuotedString("hi".into()))
        );
    }

    #[test]
    fn local_shadows_inherited() {
        let root = ModuleEnv::root();
        root.register_command("echo", ObjectRef::new(ObjectKind::Command, 1));
        let child = root.child();
        child.register_command("echo", ObjectRef::new(ObjectKind::Command, 2));
        assert_eq!(
            child.lookup_command("echo"),
            Some(ObjectRef::new(ObjectKind::Command, 2))
        );
    }

    #[test]
    fn exports_merge_into_parent_objects() {
        let root = ModuleEnv::root();
        let mut exports = HashMap::new();
        exports.insert("result".to_string(), Value::Int64(42));
        root.merge_exports(exports);
        assert_eq!(root.lookup_object("result"), Some(Value::Int64(42)));
    }
}
