//! Cache-aside entity store.
//!
//! Records of declared entity types are cached as field hashes in a
//! key-value store, located by unique key, unique index, or multi index, and
//! written back to a relational backing store.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;

pub use application::connection::Connection;
pub use application::store::{
    Instance, Lookup, PendingWrite, RetryPolicy, Step, StoreControl, StoreError, WriteFailure,
};
pub use domain::descriptor::{EntityDescriptor, SyncMode};
pub use domain::value::{FieldValue, Record};
