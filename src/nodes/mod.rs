//! Node Inventory Module
//!
//! The node record shared with every driver and the concurrency-safe
//! registry that owns the canonical node set.

pub mod events;
pub mod node;
pub mod node_registry;

pub use events::*;
pub use node::*;
pub use node_registry::*;
