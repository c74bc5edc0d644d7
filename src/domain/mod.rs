//! Domain Module
//!
//! Capability contracts implemented by every driver category.

pub mod ports;

pub use ports::*;
