//! Store services and the contracts they depend on.

pub mod connection;
pub mod error;
pub mod kv;
pub mod repos;
pub mod store;
