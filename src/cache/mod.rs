//! Cache layout and the in-process cache client.
//!
//! Every entity owns three kinds of keys:
//!
//! - **primary hash**: cached fields of one record
//! - **all-keys list**: every known unique key, newest first
//! - **index entries**: unique index strings and multi index sets

pub mod keys;
pub(crate) mod lock;
pub mod memory;

pub use keys::{CacheKey, KeySpace};
pub use memory::MemoryKv;
