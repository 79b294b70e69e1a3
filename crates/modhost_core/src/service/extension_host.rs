//! Extension host façade.
//!
//! # Responsibility
//! - Own one descriptor store, registry, hook index, dispatcher and
//!   lifecycle controller wired to the same collaborators.
//! - Expose the embedding application's entry points.
//!
//! # Invariants
//! - Every component shares the same `HookIndex` instance, so lifecycle
//!   transitions are visible to dispatch without a restart.

use crate::config::{ConfigError, HostConfig};
use crate::extension::descriptor::{
    DescriptorError, DescriptorStore, DirectoryDescriptorSource, InfoDescriptorParser,
};
use crate::extension::lifecycle::{LifecycleController, LifecycleResult, SchemaMigrator};
use crate::extension::registry::{
    ExtensionRegistry, ListKind, RefreshSummary, RegistryError, RegistryResult,
};
use crate::hook::dispatch::{AlterTypes, DispatchResult, ErrorSink, HookDispatcher};
use crate::hook::index::{HookIndex, Placement};
use crate::hook::probe::HookProbe;
use crate::model::extension::{ExtensionId, ExtensionRecord};
use crate::repo::extension_repo::{
    ExtensionStore, MemoryExtensionStore, RepoError, SqliteExtensionStore,
};
use log::info;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug)]
pub enum HostError {
    Config(ConfigError),
    Descriptor(DescriptorError),
    Registry(RegistryError),
}

impl Display for HostError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Descriptor(err) => write!(f, "{err}"),
            Self::Registry(err) => write!(f, "{err}"),
        }
    }
}

impl Error for HostError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Descriptor(err) => Some(err),
            Self::Registry(err) => Some(err),
        }
    }
}

impl From<ConfigError> for HostError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<DescriptorError> for HostError {
    fn from(value: DescriptorError) -> Self {
        Self::Descriptor(value)
    }
}

impl From<RegistryError> for HostError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

impl From<RepoError> for HostError {
    fn from(value: RepoError) -> Self {
        Self::Registry(value.into())
    }
}

/// Collaborators an `ExtensionHost` is wired to.
pub struct HostCollaborators {
    pub store: Arc<dyn ExtensionStore>,
    pub probe: Arc<dyn HookProbe>,
    pub migrator: Arc<dyn SchemaMigrator>,
    pub errors: Arc<dyn ErrorSink>,
}

/// Entry point of the extension runtime.
pub struct ExtensionHost {
    descriptors: DescriptorStore,
    registry: Arc<ExtensionRegistry>,
    index: Arc<HookIndex>,
    dispatcher: Arc<HookDispatcher>,
    lifecycle: LifecycleController,
}

impl ExtensionHost {
    pub fn new(descriptors: DescriptorStore, collaborators: HostCollaborators) -> Self {
        let HostCollaborators {
            store,
            probe,
            migrator,
            errors,
        } = collaborators;

        let index = Arc::new(HookIndex::new(Arc::clone(&probe)));
        let registry = Arc::new(ExtensionRegistry::new(store, Arc::clone(&index)));
        let dispatcher = Arc::new(HookDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&index),
            Arc::clone(&probe),
            Arc::clone(&errors),
        ));
        let lifecycle = LifecycleController::new(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            probe,
            migrator,
            errors,
        );

        Self {
            descriptors,
            registry,
            index,
            dispatcher,
            lifecycle,
        }
    }

    /// Builds a host from config: SQLite or memory store, directory
    /// descriptor source and the configured profile.
    ///
    /// Does not scan; call `rebuild` before the first lifecycle call.
    pub fn from_config(
        config: &HostConfig,
        probe: Arc<dyn HookProbe>,
        migrator: Arc<dyn SchemaMigrator>,
        errors: Arc<dyn ErrorSink>,
    ) -> HostResult<Self> {
        config.validate()?;

        let store: Arc<dyn ExtensionStore> = match config.database_path.as_ref() {
            Some(path) => Arc::new(SqliteExtensionStore::open(path)?),
            None => Arc::new(MemoryExtensionStore::new()),
        };

        let mut descriptors = DescriptorStore::new(
            DirectoryDescriptorSource::new(&config.descriptor_root),
            InfoDescriptorParser,
        );
        if let Some(profile) = config.profile.as_deref() {
            descriptors = descriptors.with_profile(profile);
        }

        info!(
            "event=host_open module=host status=ok profile={} persistent={}",
            config.profile.as_deref().unwrap_or("none"),
            config.database_path.is_some()
        );
        Ok(Self::new(
            descriptors,
            HostCollaborators {
                store,
                probe,
                migrator,
                errors,
            },
        ))
    }

    /// Rescans descriptors and reconciles records.
    pub fn rebuild(&self) -> HostResult<RefreshSummary> {
        let scanned = self.descriptors.scan_all()?;
        Ok(self.registry.refresh(scanned)?)
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<HookDispatcher> {
        &self.dispatcher
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn descriptor_store(&self) -> &DescriptorStore {
        &self.descriptors
    }

    pub fn install(&self, id: &str) -> LifecycleResult<bool> {
        self.lifecycle.install(id)
    }

    pub fn enable<I, S>(&self, ids: I, resolve_dependencies: bool) -> LifecycleResult<Vec<ExtensionId>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.lifecycle.enable(ids, resolve_dependencies)
    }

    pub fn disable<I, S>(&self, ids: I, cascade: bool) -> LifecycleResult<Vec<ExtensionId>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.lifecycle.disable(ids, cascade)
    }

    pub fn uninstall<I, S>(&self, ids: I) -> LifecycleResult<Vec<ExtensionId>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.lifecycle.uninstall(ids)
    }

    pub fn list_enabled(&self, kind: ListKind) -> RegistryResult<Vec<ExtensionRecord>> {
        self.registry.list_enabled(kind)
    }

    pub fn exists(&self, id: &str) -> RegistryResult<bool> {
        self.registry.exists(id)
    }

    pub fn record(&self, id: &str) -> RegistryResult<ExtensionRecord> {
        self.registry.get(id)
    }

    pub fn implementers_of(&self, hook: &str) -> DispatchResult<Arc<[ExtensionId]>> {
        self.dispatcher.implementers_of(hook)
    }

    pub fn set_placement(&self, hook: &str, id: &str, placement: Placement) {
        self.index.set_placement(hook, id, placement);
    }

    pub fn invoke(&self, id: &str, hook: &str, args: &Value) -> DispatchResult<Option<Value>> {
        self.dispatcher.invoke(id, hook, args)
    }

    /// Collect dispatch over every enabled implementer of `hook`.
    pub fn dispatch(&self, hook: &str, args: &Value) -> DispatchResult<Vec<(ExtensionId, Value)>> {
        self.dispatcher.invoke_all(hook, args)
    }

    pub fn invoke_all_merged(&self, hook: &str, args: &Value) -> DispatchResult<Value> {
        self.dispatcher.invoke_all_merged(hook, args)
    }

    pub fn alter(
        &self,
        types: impl Into<AlterTypes>,
        value: &mut Value,
        target: Option<&str>,
        context: &Value,
    ) -> DispatchResult<()> {
        self.dispatcher.alter(types, value, target, context)
    }
}
