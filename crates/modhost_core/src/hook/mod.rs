//! Hook capability table, implementer index and dispatch.
//!
//! # Responsibility
//! - Map `(extension, hook)` pairs to callable handlers.
//! - Cache the ordered implementer list per hook.
//! - Dispatch collect and alter calls in implementer order.
//!
//! # Invariants
//! - Only enabled extensions appear in an implementer list.
//! - Implementer order is weight ascending, then id, unless a placement
//!   override says otherwise.

pub mod dispatch;
pub mod index;
pub mod probe;

/// Hook name, e.g. `menu` or `form_alter`.
pub type HookName = String;
