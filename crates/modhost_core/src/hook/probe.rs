//! Hook capability probe and the explicit handler table.

use crate::hook::HookName;
use crate::logging::enter_hook;
use crate::model::extension::ExtensionId;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub type HookResult<T> = Result<T, HookError>;

/// Failure of one hook implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    NotImplemented {
        extension: ExtensionId,
        hook: HookName,
    },
    Failed {
        extension: ExtensionId,
        hook: HookName,
        message: String,
    },
}

impl HookError {
    pub fn extension(&self) -> &str {
        match self {
            Self::NotImplemented { extension, .. } | Self::Failed { extension, .. } => extension,
        }
    }

    pub fn hook(&self) -> &str {
        match self {
            Self::NotImplemented { hook, .. } | Self::Failed { hook, .. } => hook,
        }
    }
}

impl Display for HookError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotImplemented { extension, hook } => {
                write!(f, "extension `{extension}` does not implement hook `{hook}`")
            }
            Self::Failed {
                extension,
                hook,
                message,
            } => write!(f, "hook `{hook}` failed in extension `{extension}`: {message}"),
        }
    }
}

impl Error for HookError {}

/// Context handed to alter implementations.
#[derive(Debug, Clone, Copy)]
pub struct AlterContext<'a> {
    /// Concrete hook being run, e.g. `form_alter` or `form_login_alter`.
    pub hook: &'a str,
    /// Specific target id, when the caller supplied one.
    pub target: Option<&'a str>,
    /// Caller-provided read-only context.
    pub data: &'a Value,
}

/// Calling convention of one hook implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Takes arguments and may return a result.
    Invoke,
    /// Mutates a caller-owned value in place.
    Alter,
}

/// Answers whether an extension implements a hook and calls it.
pub trait HookProbe: Send + Sync {
    /// Kind of `extension`'s implementation of `hook`, `None` when absent.
    fn kind_of(&self, extension: &str, hook: &str) -> Option<HookKind>;

    /// True for either kind; the hook index lists both.
    fn implements(&self, extension: &str, hook: &str) -> bool {
        self.kind_of(extension, hook).is_some()
    }

    /// True only when `invoke` can run the implementation.
    fn invokable(&self, extension: &str, hook: &str) -> bool {
        self.kind_of(extension, hook) == Some(HookKind::Invoke)
    }

    fn invoke(&self, extension: &str, hook: &str, args: &Value) -> HookResult<Option<Value>>;

    fn invoke_alter(
        &self,
        extension: &str,
        hook: &str,
        value: &mut Value,
        context: &AlterContext<'_>,
    ) -> HookResult<()>;
}

type InvokeFn = dyn Fn(&Value) -> Result<Option<Value>, String> + Send + Sync;
type AlterFn = dyn Fn(&mut Value, &AlterContext<'_>) -> Result<(), String> + Send + Sync;

#[derive(Clone)]
enum Handler {
    Invoke(Arc<InvokeFn>),
    Alter(Arc<AlterFn>),
}

/// Capability table keyed by hook name, then extension id.
///
/// Populated at registration time; share it behind an `Arc` once built.
#[derive(Clone, Default)]
pub struct HookTable {
    handlers: HashMap<HookName, HashMap<ExtensionId, Handler>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a result-returning implementation, replacing any previous one.
    pub fn register<F>(&mut self, extension: &str, hook: &str, handler: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Option<Value>, String> + Send + Sync + 'static,
    {
        self.insert(extension, hook, Handler::Invoke(Arc::new(handler)))
    }

    /// Registers an alter implementation for the full hook name
    /// (`form_alter`, `form_login_alter`, ...).
    pub fn register_alter<F>(&mut self, extension: &str, hook: &str, handler: F) -> &mut Self
    where
        F: Fn(&mut Value, &AlterContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.insert(extension, hook, Handler::Alter(Arc::new(handler)))
    }

    /// Removes every handler of one extension.
    pub fn unregister_extension(&mut self, extension: &str) -> usize {
        let mut removed = 0;
        self.handlers.retain(|_, by_extension| {
            if by_extension.remove(extension).is_some() {
                removed += 1;
            }
            !by_extension.is_empty()
        });
        removed
    }

    /// Returns sorted hook names `extension` implements.
    pub fn hooks_of(&self, extension: &str) -> Vec<HookName> {
        let mut hooks: Vec<HookName> = self
            .handlers
            .iter()
            .filter(|(_, by_extension)| by_extension.contains_key(extension))
            .map(|(hook, _)| hook.clone())
            .collect();
        hooks.sort();
        hooks
    }

    fn insert(&mut self, extension: &str, hook: &str, handler: Handler) -> &mut Self {
        self.handlers
            .entry(hook.to_string())
            .or_default()
            .insert(extension.to_string(), handler);
        self
    }

    fn handler(&self, extension: &str, hook: &str) -> Option<&Handler> {
        self.handlers.get(hook)?.get(extension)
    }
}

impl HookProbe for HookTable {
    fn kind_of(&self, extension: &str, hook: &str) -> Option<HookKind> {
        self.handler(extension, hook).map(|handler| match handler {
            Handler::Invoke(_) => HookKind::Invoke,
            Handler::Alter(_) => HookKind::Alter,
        })
    }

    fn invoke(&self, extension: &str, hook: &str, args: &Value) -> HookResult<Option<Value>> {
        match self.handler(extension, hook) {
            Some(Handler::Invoke(handler)) => {
                let _scope = enter_hook(extension, hook);
                handler(args).map_err(|message| HookError::Failed {
                    extension: extension.to_string(),
                    hook: hook.to_string(),
                    message,
                })
            }
            _ => Err(HookError::NotImplemented {
                extension: extension.to_string(),
                hook: hook.to_string(),
            }),
        }
    }

    fn invoke_alter(
        &self,
        extension: &str,
        hook: &str,
        value: &mut Value,
        context: &AlterContext<'_>,
    ) -> HookResult<()> {
        match self.handler(extension, hook) {
            Some(Handler::Alter(handler)) => {
                let _scope = enter_hook(extension, hook);
                handler(value, context).map_err(|message| HookError::Failed {
                    extension: extension.to_string(),
                    hook: hook.to_string(),
                    message,
                })
            }
            _ => Err(HookError::NotImplemented {
                extension: extension.to_string(),
                hook: hook.to_string(),
            }),
        }
    }
}
