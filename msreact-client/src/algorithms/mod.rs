//! Algorithms shipped with the client.

pub mod monitor;

use crate::algorithm::AlgorithmRegistry;

/// A registry holding every built-in algorithm.
#[must_use]
pub fn builtin_registry() -> AlgorithmRegistry {
    let mut registry = AlgorithmRegistry::new();
    registry.register(monitor::definition());
    registry
}
