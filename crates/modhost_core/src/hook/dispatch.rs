//! Hook dispatch: collect, merge and alter.
//!
//! # Responsibility
//! - Call hook implementations in the order the `HookIndex` returns.
//! - Report implementer failures to an `ErrorSink`.
//!
//! # Invariants
//! - Collect dispatch never short-circuits; failing implementers are
//!   reported and omitted.
//! - Alter dispatch stops at the first failure and keeps the mutations
//!   already applied.
//! - Every extension gets at most one turn per alter call.

use crate::extension::registry::{ExtensionRegistry, RegistryError};
use crate::hook::index::HookIndex;
use crate::hook::probe::{AlterContext, HookError, HookProbe};
use crate::model::extension::ExtensionId;
use log::{debug, warn};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug)]
pub enum DispatchError {
    Registry(RegistryError),
    Implementer(HookError),
}

impl Display for DispatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry(err) => write!(f, "{err}"),
            Self::Implementer(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DispatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Registry(err) => Some(err),
            Self::Implementer(err) => Some(err),
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

/// Receives implementer failures that dispatch does not return.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &HookError);
}

/// Writes every reported failure as a warning log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, error: &HookError) {
        warn!(
            "event=hook_failure module=dispatch status=error extension={} hook={} error={}",
            error.extension(),
            error.hook(),
            error
        );
    }
}

/// Keeps reported failures in memory, for hosts that surface them later.
#[derive(Debug, Default)]
pub struct MemoryErrorSink {
    reported: Mutex<Vec<HookError>>,
}

impl MemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns and clears everything reported so far.
    pub fn take(&self) -> Vec<HookError> {
        std::mem::take(&mut *self.reported.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ErrorSink for MemoryErrorSink {
    fn report(&self, error: &HookError) {
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.clone());
    }
}

/// One or more alter types, e.g. `"form"` or `["form", "form_login"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlterTypes(Vec<String>);

impl AlterTypes {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Concrete hook names in dispatch order: each type's `<type>_alter`,
    /// followed by `<type>_<target>_alter` when a target is given.
    fn hook_names(&self, target: Option<&str>) -> Vec<String> {
        let mut names = Vec::new();
        for alter_type in &self.0 {
            names.push(format!("{alter_type}_alter"));
            if let Some(target) = target {
                names.push(format!("{alter_type}_{target}_alter"));
            }
        }
        names
    }
}

impl From<&str> for AlterTypes {
    fn from(value: &str) -> Self {
        Self(vec![value.to_string()])
    }
}

impl From<String> for AlterTypes {
    fn from(value: String) -> Self {
        Self(vec![value])
    }
}

impl From<&[&str]> for AlterTypes {
    fn from(value: &[&str]) -> Self {
        Self(value.iter().map(|value| value.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for AlterTypes {
    fn from(value: [&str; N]) -> Self {
        Self(value.iter().map(|value| value.to_string()).collect())
    }
}

impl From<Vec<String>> for AlterTypes {
    fn from(value: Vec<String>) -> Self {
        Self(value)
    }
}

/// Dispatches hooks to enabled implementers.
pub struct HookDispatcher {
    registry: Arc<ExtensionRegistry>,
    index: Arc<HookIndex>,
    probe: Arc<dyn HookProbe>,
    errors: Arc<dyn ErrorSink>,
}

impl HookDispatcher {
    pub fn new(
        registry: Arc<ExtensionRegistry>,
        index: Arc<HookIndex>,
        probe: Arc<dyn HookProbe>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            registry,
            index,
            probe,
            errors,
        }
    }

    /// Ordered implementers of `hook` among enabled extensions.
    pub fn implementers_of(&self, hook: &str) -> DispatchResult<Arc<[ExtensionId]>> {
        Ok(self.index.implementers_of(hook, &self.registry)?)
    }

    /// Invokes `hook` on one extension.
    ///
    /// Returns `Ok(None)` when the extension is not enabled or does not
    /// implement the hook.
    pub fn invoke(&self, extension: &str, hook: &str, args: &Value) -> DispatchResult<Option<Value>> {
        let enabled = self.index.enabled(&self.registry)?;
        if !enabled.iter().any(|id| id == extension) || !self.probe.invokable(extension, hook) {
            return Ok(None);
        }
        self.probe
            .invoke(extension, hook, args)
            .map_err(DispatchError::Implementer)
    }

    /// Collect dispatch: every implementer's non-absent result, in order.
    ///
    /// Alter implementations registered under the same name are skipped.
    pub fn invoke_all(&self, hook: &str, args: &Value) -> DispatchResult<Vec<(ExtensionId, Value)>> {
        let implementers = self.implementers_of(hook)?;
        let mut results = Vec::with_capacity(implementers.len());
        for extension in implementers.iter() {
            if !self.probe.invokable(extension, hook) {
                continue;
            }
            match self.probe.invoke(extension, hook, args) {
                Ok(Some(value)) => results.push((extension.clone(), value)),
                Ok(None) => {}
                Err(err) => self.errors.report(&err),
            }
        }
        debug!(
            "event=hook_dispatch module=dispatch status=ok hook={} implementers={} results={}",
            hook,
            implementers.len(),
            results.len()
        );
        Ok(results)
    }

    /// Collect dispatch whose object results are merged recursively.
    ///
    /// Objects merge key by key, lists concatenate and conflicting scalars
    /// become a list of both. Non-object results are skipped.
    pub fn invoke_all_merged(&self, hook: &str, args: &Value) -> DispatchResult<Value> {
        let mut merged = Map::new();
        for (extension, value) in self.invoke_all(hook, args)? {
            match value {
                Value::Object(object) => merge_objects(&mut merged, object),
                _ => debug!(
                    "event=hook_merge module=dispatch status=skipped hook={} extension={}",
                    hook, extension
                ),
            }
        }
        Ok(Value::Object(merged))
    }

    /// Alter dispatch: lets every implementer mutate `value` in turn.
    ///
    /// With several types, the union of implementers is ordered like the
    /// enabled list and each extension runs all its matching hooks in type
    /// order during its single turn. With a target, `<type>_<target>_alter`
    /// runs right after the same extension's `<type>_alter`.
    pub fn alter(
        &self,
        types: impl Into<AlterTypes>,
        value: &mut Value,
        target: Option<&str>,
        context: &Value,
    ) -> DispatchResult<()> {
        let types = types.into();
        let hooks = types.hook_names(target);
        if hooks.is_empty() {
            return Ok(());
        }

        let mut per_hook: Vec<(String, Arc<[ExtensionId]>)> = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let implementers = self.implementers_of(&hook)?;
            per_hook.push((hook, implementers));
        }

        let order = self.alter_order(&per_hook)?;
        for extension in &order {
            for (hook, implementers) in &per_hook {
                if !implementers.iter().any(|id| id == extension) {
                    continue;
                }
                let alter_context = AlterContext {
                    hook,
                    target,
                    data: context,
                };
                if let Err(err) = self
                    .probe
                    .invoke_alter(extension, hook, value, &alter_context)
                {
                    self.errors.report(&err);
                    return Err(DispatchError::Implementer(err));
                }
            }
        }

        debug!(
            "event=hook_alter module=dispatch status=ok types={} implementers={}",
            types.as_slice().join(","),
            order.len()
        );
        Ok(())
    }

    /// Union of implementers across hooks.
    ///
    /// When only the first hook has implementers its index order, including
    /// placement overrides, is kept as is.
    fn alter_order(&self, per_hook: &[(String, Arc<[ExtensionId]>)]) -> DispatchResult<Vec<ExtensionId>> {
        let Some(((_, primary), rest)) = per_hook.split_first() else {
            return Ok(Vec::new());
        };

        let mut order: Vec<ExtensionId> = primary.to_vec();
        let mut seen: HashSet<&str> = primary.iter().map(String::as_str).collect();
        let mut extended = false;
        for (_, implementers) in rest {
            for extension in implementers.iter() {
                if seen.insert(extension.as_str()) {
                    order.push(extension.clone());
                    extended = true;
                }
            }
        }

        if extended {
            let enabled = self.index.enabled(&self.registry)?;
            let rank: HashMap<&str, usize> = enabled
                .iter()
                .enumerate()
                .map(|(position, id)| (id.as_str(), position))
                .collect();
            order.sort_by_key(|id| rank.get(id.as_str()).copied().unwrap_or(usize::MAX));
        }
        Ok(order)
    }
}

fn merge_objects(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, incoming) in source {
        match target.get_mut(&key) {
            Some(existing) => merge_value(existing, incoming),
            None => {
                target.insert(key, incoming);
            }
        }
    }
}

fn merge_value(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(current), Value::Object(incoming)) => merge_objects(current, incoming),
        (Value::Array(current), Value::Array(incoming)) => current.extend(incoming),
        (Value::Array(current), incoming) => current.push(incoming),
        (existing, incoming) => {
            let mut items = vec![existing.take()];
            match incoming {
                Value::Array(values) => items.extend(values),
                other => items.push(other),
            }
            *existing = Value::Array(items);
        }
    }
}
