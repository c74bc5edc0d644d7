//! Driver Registry Module
//!
//! Name-keyed registries that let a scenario pick a concrete backend for a
//! capability at runtime.

pub mod categories;
pub mod driver_registry;

pub use categories::*;
pub use driver_registry::*;
