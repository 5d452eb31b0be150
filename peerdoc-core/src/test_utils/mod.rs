//! Test utilities for peerdoc
//!
//! Fixtures for building peers and models, a deterministic in-process
//! network that drives several synchronizers to quiescence, and helpers for
//! async host tests.

pub mod async_helpers;
pub mod fixtures;
pub mod sim;

pub use async_helpers::*;
pub use fixtures::*;
pub use sim::*;
