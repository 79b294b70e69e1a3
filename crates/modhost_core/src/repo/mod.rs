//! Persistence contracts for extension lifecycle records.
//!
//! # Responsibility
//! - Define the key/value store contract the registry persists through.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - Write paths call `ExtensionRecord::validate()` before persisting.
//! - Read paths reject invalid persisted state instead of masking it.

pub mod extension_repo;
