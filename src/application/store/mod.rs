//! Cache-aside entity store.
//!
//! [`StoreControl`] owns the read path, index maintenance, and mutations of
//! one entity type. [`Instance`] narrows it to a single record.

mod control;
mod error;
mod instance;
mod lookup;
pub mod metrics;
mod writes;

pub use control::StoreControl;
pub use error::StoreError;
pub use instance::{Instance, Step};
pub use lookup::Lookup;
pub use writes::{FailureHook, PendingWrite, RetryPolicy, WriteFailure};
