//! Typed object graph kernel, sync fragments, and the scope apply pipeline.
//!
//! This crate is the bottom of the Jetstream stack (spec §4.1-§4.3): model
//! types and their runtime instances live in [`kernel`], the patch record
//! that mutates them lives in [`fragment`], and the container that
//! serializes mutation, tracks reachability, and broadcasts the result
//! lives in [`scope`].

pub mod error;
pub mod fragment;
pub mod kernel;
pub mod scope;

pub use error::{FragmentError, KernelError, ScopeError};
pub use fragment::{FragmentKind, LateBoundFragment, SyncFragment};
pub use kernel::{
    DeclareError, EnumDefForm, EnumTypeDescriptor, ModelObject, ModelTypeDescriptor,
    PropertyDescriptor, PropertyKind, PropertyValue, ScopeBinding, TypeBuilder, TypeRegistry,
};
pub use scope::{
    ApplyContext, ApplyOptions, ChangeEvent, ChangeReceiver, FragmentOutcome, InMemoryBackend,
    PersistenceBackend, Scope, ScopeConfig, ScopeCursor, ScopeHandle,
};
