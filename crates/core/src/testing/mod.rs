//! Test helpers: tiny configs and deterministic random checkpoints.
//!
//! Compiled for unit tests and behind the `test-utils` feature so
//! integration tests and benches can share them.

mod checkpoint;
mod tiny_config;

pub use checkpoint::{random_checkpoint, random_var_builder};
pub use tiny_config::tiny_config;
