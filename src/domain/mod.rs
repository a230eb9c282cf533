//! Domain layer types and invariants.

pub mod coercion;
pub mod descriptor;
pub mod error;
pub mod filter;
pub mod value;
