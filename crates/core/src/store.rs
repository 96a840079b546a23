//! Object Store (C2): the central typed heap with explicit reference
//! counting, free-list id reuse, and typed cleanup.
//!
//! Grounded on the teacher's `runtime/src/channel.rs` registry shape — a
//! `Mutex<HashMap<id, Entry>>` behind an `AtomicU64` id generator — but
//! specialized for ref-counted ownership instead of MPMC message passing,
//! and on `crates/core/src/memory_stats.rs` for the live/registered
//! counters exposed through [`ObjectStore::stats`].
//!
//! Kind-specific cleanup (closing a `File` descriptor, draining `Channel`
//! subscribers, merging a `Fiber`'s bubble map) is domain knowledge that
//! lives in `pawscript-runtime`, not here — so those kinds plug in through
//! the [`TypedPayload`] trait object rather than baking runtime types into
//! this crate. `List`/`Bytes`/`Struct` are plain enough to live directly
//! in [`StoredPayload`] since the store already walks `Value`s for nested
//! refs regardless of payload shape.

use crate::value::{ObjectKind, ObjectRef, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A named argument pair, used by `List` payloads that carry both
/// positional items and named arguments (see C7, `$@`).
pub type NamedValue = (String, Value);

/// Kind-specific payload that isn't a plain composite of [`Value`]s.
/// Implementors describe how to find nested object refs (so the store can
/// release them) and what to do when the owning object's ref count hits
/// zero.
pub trait TypedPayload: std::fmt::Debug + Send {
    /// Object refs reachable from this payload, for recursive release.
    fn nested_refs(&self) -> Vec<ObjectRef> {
        Vec::new()
    }

    /// Invoked exactly once, **outside** the store lock, when the owning
    /// object's ref count reaches zero. Implementors close file
    /// descriptors, drain channel subscribers, evict parser caches, etc.
    fn on_release(&mut self) {}
}

#[derive(Debug)]
pub enum StoredPayload {
    List {
        items: Vec<Value>,
        named: Vec<NamedValue>,
    },
    StringData(String),
    Bytes(Vec<u8>),
    Struct(Vec<NamedValue>),
    Other(Box<dyn TypedPayload>),
}

impl StoredPayload {
    fn nested_refs(&self) -> Vec<ObjectRef> {
        let scan = |v: &Value| v.object_ref();
        match self {
            StoredPayload::List { items, named } => items
                .iter()
                .chain(named.iter().map(|(_, v)| v))
                .filter_map(scan)
                .collect(),
            StoredPayload::Struct(fields) => {
                fields.iter().filter_map(|(_, v)| scan(v)).collect()
            }
            StoredPayload::StringData(_) | StoredPayload::Bytes(_) => Vec::new(),
            StoredPayload::Other(p) => p.nested_refs(),
        }
    }

    fn on_release(&mut self) {
        if let StoredPayload::Other(p) = self {
            p.on_release();
        }
    }
}

struct StoredObject {
    payload: StoredPayload,
    kind: ObjectKind,
    ref_count: u64,
    deleted: bool,
}

/// Point-in-time counters for diagnostics (§6 ADD, grounded on
/// `memory_stats.rs`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub live_objects: usize,
    pub free_ids: usize,
    pub total_registered: u64,
}

struct Inner {
    objects: HashMap<u64, StoredObject>,
    free_list: Vec<u64>,
    /// Canonical id for the shared empty list, if one has been registered
    /// (§4.2 "Empty-list deduplication").
    empty_list_id: Option<u64>,
}

/// The heap. One instance per [`crate::frame::Executor`]-equivalent; all
/// operations are atomic under a single internal lock, matching §4.2's
/// "all atomic under one lock per store."
pub struct ObjectStore {
    next_id: AtomicU64,
    total_registered: AtomicU64,
    inner: Mutex<Inner>,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            total_registered: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                objects: HashMap::new(),
                free_list: Vec::new(),
                empty_list_id: None,
            }),
        }
    }

    /// Insert `payload` with `ref_count == 0`, reusing a free id if one is
    /// available. The caller (variable setter, result setter, or an
    /// explicit `claim`) is the first to bring the count to one — see §9
    /// Design Notes, "constructors return refs with count zero."
    pub fn register(&self, payload: StoredPayload, kind: ObjectKind) -> ObjectRef {
        if kind == ObjectKind::List {
            if let StoredPayload::List { items, named } = &payload {
                if items.is_empty() && named.is_empty() {
                    let mut guard = self.lock();
                    if let Some(id) = guard.empty_list_id {
                        if guard.objects.contains_key(&id) {
                            return ObjectRef::new(ObjectKind::List, id);
                        }
                    }
                    let id = self.allocate_id(&mut guard);
                    guard.objects.insert(
                        id,
                        StoredObject {
                            payload,
                            kind,
                            ref_count: 0,
                            deleted: false,
                        },
                    );
                    guard.empty_list_id = Some(id);
                    return ObjectRef::new(kind, id);
                }
            }
        }

        let mut guard = self.lock();
        let id = self.allocate_id(&mut guard);
        guard.objects.insert(
            id,
            StoredObject {
                payload,
                kind,
                ref_count: 0,
                deleted: false,
            },
        );
        ObjectRef::new(kind, id)
    }

    fn allocate_id(&self, guard: &mut Inner) -> u64 {
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        if let Some(id) = guard.free_list.pop() {
            id
        } else {
            self.next_id.fetch_add(1, Ordering::Relaxed)
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("object store lock poisoned: a prior release panicked while holding it")
    }

    /// `ref_count += 1`. Fails silently (returns `false`) on an invalid or
    /// already-deleted ref — callers typically log this via their
    /// `Context`.
    pub fn claim(&self, obj_ref: ObjectRef) -> bool {
        let mut guard = self.lock();
        match guard.objects.get_mut(&obj_ref.id) {
            Some(obj) if !obj.deleted && obj.kind == obj_ref.kind => {
                obj.ref_count += 1;
                true
            }
            _ => false,
        }
    }

    /// `ref_count -= 1`; if it reaches zero, marks the object deleted,
    /// pushes its id onto the free list, then — **outside the store
    /// lock** — runs typed cleanup and returns the nested refs the caller
    /// must release in turn. This is the "release never recurses under
    /// the store lock" property from §4.2.
    pub fn release(&self, obj_ref: ObjectRef) -> bool {
        let mut payload_to_clean = None;
        {
            let mut guard = self.lock();
            match guard.objects.get_mut(&obj_ref.id) {
                Some(obj) if !obj.deleted && obj.kind == obj_ref.kind => {
                    if obj.ref_count == 0 {
                        return false;
                    }
                    obj.ref_count -= 1;
                    if obj.ref_count == 0 {
                        obj.deleted = true;
                        guard.free_list.push(obj_ref.id);
                        if guard.empty_list_id == Some(obj_ref.id) {
                            guard.empty_list_id = None;
                        }
                        if let Some(removed) = guard.objects.remove(&obj_ref.id) {
                            payload_to_clean = Some(removed.payload);
                        }
                    }
                }
                _ => return false,
            }
        }

        if let Some(mut payload) = payload_to_clean {
            let nested = payload.nested_refs();
            payload.on_release();
            for child in nested {
                self.release(child);
            }
        }
        true
    }

    /// Non-counting borrow for immediate read.
    pub fn with<R>(&self, obj_ref: ObjectRef, f: impl FnOnce(&StoredPayload) -> R) -> Option<R> {
        let guard = self.lock();
        guard
            .objects
            .get(&obj_ref.id)
            .filter(|obj| !obj.deleted && obj.kind == obj_ref.kind)
            .map(|obj| f(&obj.payload))
    }

    pub fn with_mut<R>(
        &self,
        obj_ref: ObjectRef,
        f: impl FnOnce(&mut StoredPayload) -> R,
    ) -> Option<R> {
        let mut guard = self.lock();
        guard
            .objects
            .get_mut(&obj_ref.id)
            .filter(|obj| !obj.deleted && obj.kind == obj_ref.kind)
            .map(|obj| f(&mut obj.payload))
    }

    pub fn ref_count(&self, obj_ref: ObjectRef) -> Option<u64> {
        let guard = self.lock();
        guard
            .objects
            .get(&obj_ref.id)
            .filter(|obj| !obj.deleted && obj.kind == obj_ref.kind)
            .map(|obj| obj.ref_count)
    }

    /// Identity lookup for a payload shape the store canonicalizes, used
    /// when a caller is about to register a freshly-built payload and
    /// wants to know whether an equivalent canonical object already
    /// exists instead (§4.2 `find_by_identity`). Presently this only
    /// recognizes the empty list — the store does no general
    /// content-based dedup, only identity lookup for the one shape it
    /// canonicalizes in [`ObjectStore::register`].
    pub fn find_by_identity(&self, kind: ObjectKind, items: &[Value], named: &[NamedValue]) -> Option<ObjectRef> {
        if kind != ObjectKind::List || !items.is_empty() || !named.is_empty() {
            return None;
        }
        let guard = self.lock();
        let id = guard.empty_list_id?;
        guard.objects.contains_key(&id).then(|| ObjectRef::new(ObjectKind::List, id))
    }

    pub fn stats(&self) -> StoreStats {
        let guard = self.lock();
        StoreStats {
            live_objects: guard.objects.len(),
            free_ids: guard.free_list.len(),
            total_registered: self.total_registered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(values: Vec<Value>) -> StoredPayload {
        StoredPayload::List {
            items: values,
            named: Vec::new(),
        }
    }

    #[test]
    fn register_then_claim_then_release_frees_id() {
        let store = ObjectStore::new();
        let r = store.register(list_of(vec![Value::Int64(1)]), ObjectKind::List);
        assert_eq!(store.ref_count(r), Some(0));
        assert!(store.claim(r));
        assert_eq!(store.ref_count(r), Some(1));
        assert!(store.release(r));
        assert_eq!(store.ref_count(r), None);
        assert_eq!(store.stats().live_objects, 0);
        assert_eq!(store.stats().free_ids, 1);
    }

    #[test]
    fn free_id_is_reused() {
        let store = ObjectStore::new();
        let r1 = store.register(list_of(vec![]), ObjectKind::Struct);
        store.claim(r1);
        store.release(r1);
        let r2 = store.register(StoredPayload::Bytes(vec![1, 2, 3]), ObjectKind::Bytes);
        assert_eq!(r1.id, r2.id, "freed id should be reused");
    }

    #[test]
    fn release_of_list_cascades_to_nested_refs() {
        let store = ObjectStore::new();
        let inner = store.register(list_of(vec![Value::Int64(9)]), ObjectKind::List);
        store.claim(inner);
        let outer = store.register(
            list_of(vec![Value::ObjectRef(inner)]),
            ObjectKind::List,
        );
        store.claim(outer);
        assert_eq!(store.ref_count(inner), Some(1));
        store.release(outer);
        assert_eq!(store.ref_count(inner), None, "nested ref must be released");
    }

    #[test]
    fn claim_and_release_on_invalid_ref_fail_silently() {
        let store = ObjectStore::new();
        let bogus = ObjectRef::new(ObjectKind::List, 999);
        assert!(!store.claim(bogus));
        assert!(!store.release(bogus));
    }

    #[test]
    fn release_below_zero_is_rejected() {
        let store = ObjectStore::new();
        let r = store.register(list_of(vec![]), ObjectKind::List);
        assert!(!store.release(r), "releasing with ref_count already 0 must fail");
    }

    #[test]
    fn empty_lists_are_deduplicated_by_identity() {
        let store = ObjectStore::new();
        let a = store.register(list_of(vec![]), ObjectKind::List);
        let b = store.register(list_of(vec![]), ObjectKind::List);
        assert_eq!(a.id, b.id, "empty lists should share a canonical id");
    }

    #[test]
    fn find_by_identity_returns_canonical_empty_list() {
        let store = ObjectStore::new();
        let a = store.register(list_of(vec![]), ObjectKind::List);
        let found = store.find_by_identity(ObjectKind::List, &[], &[]);
        assert_eq!(found, Some(a));
        assert_eq!(store.find_by_identity(ObjectKind::List, &[Value::Int64(1)], &[]), None);
    }

    #[derive(Debug)]
    struct TrackedPayload {
        released: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl TypedPayload for TrackedPayload {
        fn on_release(&mut self) {
            self.released
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn typed_payload_on_release_runs_once() {
        let store = ObjectStore::new();
        let released = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let r = store.register(
            StoredPayload::Other(Box::new(TrackedPayload {
                released: released.clone(),
            })),
            ObjectKind::File,
        );
        store.claim(r);
        assert!(!released.load(std::sync::atomic::Ordering::SeqCst));
        store.release(r);
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
    }

    /// A `File` stored object (§3 Stored objects) backed by a real
    /// descriptor, proving `on_release` runs the kind-specific cleanup
    /// `TypedPayload`'s doc comment promises ("closes file descriptors")
    /// rather than just flipping a flag.
    #[derive(Debug)]
    struct OpenFilePayload(Option<std::fs::File>);

    impl TypedPayload for OpenFilePayload {
        fn on_release(&mut self) {
            self.0.take();
        }
    }

    #[test]
    fn file_object_descriptor_closes_on_release() {
        let dir = tempfile::tempdir().expect("create scratch dir");
        let path = dir.path().join("pawscript-store-test.txt");
        let handle = std::fs::File::create(&path).expect("create scratch file");

        let store = ObjectStore::new();
        let r = store.register(StoredPayload::Other(Box::new(OpenFilePayload(Some(handle)))), ObjectKind::File);
        store.claim(r);
        assert_eq!(store.ref_count(r), Some(1));

        let checked = store.with(r, |payload| {
            let StoredPayload::Other(p) = payload else {
                panic!("expected an Other payload");
            };
            format!("{p:?}").contains("Some")
        });
        assert_eq!(checked, Some(true), "descriptor must still be open while claimed");

        store.release(r);
        assert_eq!(store.ref_count(r), None);
    }
}
