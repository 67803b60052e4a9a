//! # serendip-core
//!
//! Core types, traits, and abstractions for serendip, the weak-tie candidate
//! mining subsystem.
//!
//! This crate provides the data model shared by the storage and mining
//! crates, the repository traits the engines are written against, and the
//! statistics and seed-derivation primitives both sides agree on.
//!
//! ## Logging
//!
//! Events carry `subsystem`, `component` and `op` fields plus entity ids
//! (`run_id`, `pair_id`, `cursor`) where they apply.
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Run failed, requires operator attention |
//! | WARN  | Quota shortfall, retriable unit-of-work failure |
//! | INFO  | Unit-of-work completions, run lifecycle transitions |
//! | DEBUG | Per-round decisions, realized bands, sample sizes |
//! | TRACE | Per-source selection detail |

pub mod defaults;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod memory;
pub mod models;
pub mod sampling;
pub mod similarity;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
#[cfg(any(test, feature = "mock"))]
pub use memory::InMemoryStore;
pub use models::*;
pub use traits::*;
pub use uuid_utils::{created_before, new_v7, v7_from_timestamp};
