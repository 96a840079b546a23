//! PawScript Core: value model, object store, and execution state.
//!
//! This crate is the language-agnostic foundation beneath
//! `pawscript-runtime`: it knows about [`Value`], the ref-counted
//! [`store::ObjectStore`], and the per-invocation [`frame::Frame`], but
//! nothing about substitution, command dispatch, tokens, macros, or
//! fibers — those live one crate up.
//!
//! # Modules
//!
//! - `value`: tagged `Value` enum and in-band marker encoding (C1)
//! - `store`: ref-counted object store with free-list id reuse (C2)
//! - `frame`: per-invocation execution state (C3)
//! - `module_env`: split local/inherited command & macro namespaces
//! - `error`: the core's error kinds (§7)
//! - `position`: source positions threaded through values and errors

pub mod error;
pub mod frame;
pub mod module_env;
pub mod position;
pub mod store;
pub mod value;

pub use error::{ErrorKind, PawError};
pub use frame::{extract_refs, BubbleEntry, BubbleMap, Frame};
pub use module_env::{ModuleEnv, Namespace};
pub use position::Position;
pub use store::{NamedValue, ObjectStore, StoreStats, StoredPayload, TypedPayload};
pub use value::{encode_marker, parse_marker, ObjectKind, ObjectRef, Value};
