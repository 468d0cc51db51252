#![forbid(unsafe_code)]
//! amberfs public API facade.
//!
//! Re-exports the engine through a stable external interface. This is the
//! crate that downstream consumers (CLI, tooling, tests) depend on.

pub use amber_fs::*;
