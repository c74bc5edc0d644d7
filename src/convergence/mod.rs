//! Convergence
//!
//! A timeout-bounded polling engine and the recipes that drive long-running
//! infrastructure transitions through it.

pub mod recipes;
pub mod retry;

pub use recipes::converge_all;
pub use retry::*;
