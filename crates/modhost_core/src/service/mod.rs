//! Host-level services.
//!
//! # Responsibility
//! - Wire registry, lifecycle and dispatch components into one entry point.
//! - Keep embedding applications decoupled from component construction.

pub mod extension_host;
