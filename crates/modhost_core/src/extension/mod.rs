//! Extension discovery, dependency resolution and lifecycle.
//!
//! # Responsibility
//! - Turn descriptor sources into a validated descriptor set.
//! - Order activation by dependencies, weight and id.
//! - Persist lifecycle transitions through the registry.
//!
//! # Invariants
//! - An enabled extension has every dependency enabled.
//! - Lifecycle calls either fully apply or leave records unchanged.

pub mod descriptor;
pub mod lifecycle;
pub mod registry;
pub mod resolver;
