//! Extension domain model.
//!
//! # Responsibility
//! - Define the immutable descriptor shape produced by a scan.
//! - Define the persisted lifecycle record kept per extension.
//!
//! # Invariants
//! - Every extension is identified by a stable `ExtensionId`.
//! - Descriptors are replaced wholesale on re-scan, never patched in place.

pub mod extension;
