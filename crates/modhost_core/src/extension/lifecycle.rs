//! Install/enable/disable/uninstall orchestration.
//!
//! # Responsibility
//! - Validate lifecycle requests against dependencies and records.
//! - Drive `SchemaMigrator` and per-extension lifecycle hooks.
//! - Apply record transitions atomically through a rollback journal.
//!
//! # Invariants
//! - Transitions are serialized by one mutex per controller.
//! - A failed call leaves every record as it was before the call.
//! - Batch hooks (`modules_*`) fire only after a call committed.
//! - Per-extension `disable` hooks fire after that extension's record write.
//! - Per-extension `uninstall` hooks fire before the schema is removed so the
//!   extension can still read its data. A rollback restores records and
//!   schemas but cannot take back hooks that already ran.

use crate::extension::descriptor::DescriptorSet;
use crate::extension::registry::{now_millis, ExtensionRegistry, RegistryError};
use crate::extension::resolver::{DependencyResolver, ResolveError};
use crate::hook::dispatch::{ErrorSink, HookDispatcher};
use crate::hook::probe::{HookError, HookProbe};
use crate::model::extension::{
    BootstrapHook, ExtensionId, ExtensionRecord, ExtensionStatus, SCHEMA_UNINSTALLED,
};
use crate::repo::extension_repo::RepoError;
use log::{error, info, warn};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const HOOK_INSTALL: &str = "install";
pub const HOOK_ENABLE: &str = "enable";
pub const HOOK_DISABLE: &str = "disable";
pub const HOOK_UNINSTALL: &str = "uninstall";
pub const HOOK_REQUIREMENTS: &str = "requirements";
pub const HOOK_MODULES_INSTALLED: &str = "modules_installed";
pub const HOOK_MODULES_ENABLED: &str = "modules_enabled";
pub const HOOK_MODULES_DISABLED: &str = "modules_disabled";
pub const HOOK_MODULES_UNINSTALLED: &str = "modules_uninstalled";

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Creates and drops extension-owned schema.
pub trait SchemaMigrator: Send + Sync {
    /// Installs schema for `extension` at its declared `version`.
    fn install(&self, extension: &str, version: i32) -> Result<(), String>;
    fn uninstall(&self, extension: &str) -> Result<(), String>;
}

/// Migrator for extensions that own no schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSchemaMigrator;

impl SchemaMigrator for NoopSchemaMigrator {
    fn install(&self, _extension: &str, _version: i32) -> Result<(), String> {
        Ok(())
    }

    fn uninstall(&self, _extension: &str) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug)]
pub enum LifecycleError {
    UnknownExtension(ExtensionId),
    /// Install requested while a dependency is not installed.
    MissingDependency {
        extension: ExtensionId,
        dependency: ExtensionId,
    },
    /// Verbatim enable with a dependency neither enabled nor earlier in
    /// the list.
    UnmetDependency {
        extension: ExtensionId,
        dependency: ExtensionId,
    },
    DependentsStillEnabled {
        extension: ExtensionId,
        dependents: Vec<ExtensionId>,
    },
    UninstallBlocked {
        extension: ExtensionId,
        dependents: Vec<ExtensionId>,
    },
    RequiredExtension(ExtensionId),
    NotDisabled(ExtensionId),
    RequirementsNotMet {
        extension: ExtensionId,
        messages: Vec<String>,
    },
    Migration {
        extension: ExtensionId,
        message: String,
    },
    Resolve(ResolveError),
    Hook(HookError),
    Registry(RegistryError),
}

impl Display for LifecycleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownExtension(id) => write!(f, "unknown extension: {id}"),
            Self::MissingDependency {
                extension,
                dependency,
            } => write!(
                f,
                "cannot install `{extension}`: dependency `{dependency}` is not installed"
            ),
            Self::UnmetDependency {
                extension,
                dependency,
            } => write!(
                f,
                "cannot enable `{extension}`: dependency `{dependency}` is not enabled"
            ),
            Self::DependentsStillEnabled {
                extension,
                dependents,
            } => write!(
                f,
                "cannot disable `{extension}`: required by enabled {}",
                dependents.join(", ")
            ),
            Self::UninstallBlocked {
                extension,
                dependents,
            } => write!(
                f,
                "cannot uninstall `{extension}`: required by installed {}",
                dependents.join(", ")
            ),
            Self::RequiredExtension(id) => write!(f, "extension `{id}` is required"),
            Self::NotDisabled(id) => write!(f, "extension `{id}` must be disabled first"),
            Self::RequirementsNotMet {
                extension,
                messages,
            } => write!(
                f,
                "requirements of `{extension}` not met: {}",
                messages.join("; ")
            ),
            Self::Migration { extension, message } => {
                write!(f, "schema migration failed for `{extension}`: {message}")
            }
            Self::Resolve(err) => write!(f, "{err}"),
            Self::Hook(err) => write!(f, "{err}"),
            Self::Registry(err) => write!(f, "{err}"),
        }
    }
}

impl Error for LifecycleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Resolve(err) => Some(err),
            Self::Hook(err) => Some(err),
            Self::Registry(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ResolveError> for LifecycleError {
    fn from(value: ResolveError) -> Self {
        Self::Resolve(value)
    }
}

impl From<HookError> for LifecycleError {
    fn from(value: HookError) -> Self {
        Self::Hook(value)
    }
}

impl From<RegistryError> for LifecycleError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::NotFound(id) => Self::UnknownExtension(id),
            other => Self::Registry(other),
        }
    }
}

impl From<RepoError> for LifecycleError {
    fn from(value: RepoError) -> Self {
        RegistryError::from(value).into()
    }
}

/// Undo log of one lifecycle call.
struct Journal<'c> {
    registry: &'c ExtensionRegistry,
    migrator: &'c dyn SchemaMigrator,
    before: Vec<ExtensionRecord>,
    touched: HashSet<ExtensionId>,
    schemas_installed: Vec<ExtensionId>,
    schemas_removed: Vec<(ExtensionId, i32)>,
}

impl<'c> Journal<'c> {
    fn new(registry: &'c ExtensionRegistry, migrator: &'c dyn SchemaMigrator) -> Self {
        Self {
            registry,
            migrator,
            before: Vec::new(),
            touched: HashSet::new(),
            schemas_installed: Vec::new(),
            schemas_removed: Vec::new(),
        }
    }

    /// Persists `record`, snapshotting its first pre-call state.
    fn write(&mut self, record: &ExtensionRecord) -> LifecycleResult<()> {
        if self.touched.insert(record.id.clone()) {
            self.before.push(self.registry.get(&record.id)?);
        }
        self.registry.apply_transition(record)?;
        Ok(())
    }

    fn schema_installed(&mut self, id: &str) {
        self.schemas_installed.push(id.to_string());
    }

    fn schema_removed(&mut self, id: &str, version: i32) {
        self.schemas_removed.push((id.to_string(), version));
    }

    fn rollback(self) {
        for id in self.schemas_installed.iter().rev() {
            if let Err(err) = self.migrator.uninstall(id) {
                warn!(
                    "event=lifecycle_rollback module=lifecycle status=error id={} step=schema_uninstall error={}",
                    id, err
                );
            }
        }
        for (id, version) in self.schemas_removed.iter().rev() {
            if let Err(err) = self.migrator.install(id, *version) {
                warn!(
                    "event=lifecycle_rollback module=lifecycle status=error id={} step=schema_install error={}",
                    id, err
                );
            }
        }
        for record in self.before.iter().rev() {
            if let Err(err) = self.registry.apply_transition(record) {
                error!(
                    "event=lifecycle_rollback module=lifecycle status=error id={} step=record_restore error={}",
                    record.id, err
                );
            }
        }
        info!(
            "event=lifecycle_rollback module=lifecycle status=ok records={}",
            self.before.len()
        );
    }
}

/// Serializes lifecycle transitions over one registry.
pub struct LifecycleController {
    registry: Arc<ExtensionRegistry>,
    dispatcher: Arc<HookDispatcher>,
    probe: Arc<dyn HookProbe>,
    migrator: Arc<dyn SchemaMigrator>,
    errors: Arc<dyn ErrorSink>,
    lock: Mutex<()>,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<ExtensionRegistry>,
        dispatcher: Arc<HookDispatcher>,
        probe: Arc<dyn HookProbe>,
        migrator: Arc<dyn SchemaMigrator>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            probe,
            migrator,
            errors,
            lock: Mutex::new(()),
        }
    }

    /// Installs one extension without enabling it.
    ///
    /// Returns `false` when it was already installed.
    pub fn install(&self, id: &str) -> LifecycleResult<bool> {
        let _guard = self.lock();
        let descriptors = self.registry.descriptors();
        let mut journal = Journal::new(&self.registry, self.migrator.as_ref());

        match self.install_one(id, &descriptors, &mut journal) {
            Ok(installed) => {
                if installed {
                    self.broadcast(HOOK_MODULES_INSTALLED, &[id.to_string()]);
                }
                Ok(installed)
            }
            Err(err) => Err(self.abort("install", journal, err)),
        }
    }

    /// Enables `ids`, installing first where needed.
    ///
    /// Returns the ids that changed state, in activation order.
    pub fn enable<I, S>(&self, ids: I, resolve_dependencies: bool) -> LifecycleResult<Vec<ExtensionId>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let _guard = self.lock();
        let requested: Vec<ExtensionId> = ids.into_iter().map(|id| id.as_ref().to_string()).collect();
        let descriptors = self.registry.descriptors();
        let records = self.registry.records()?;
        for id in &requested {
            if !descriptors.contains_key(id) || !records.contains_key(id) {
                return Err(LifecycleError::UnknownExtension(id.clone()));
            }
        }

        let is_enabled = |id: &str| records.get(id).is_some_and(ExtensionRecord::is_enabled);
        let plan: Vec<ExtensionId> = if resolve_dependencies {
            self.registry
                .resolver(&descriptors)?
                .resolve(&requested)?
                .into_iter()
                .filter(|id| !is_enabled(id.as_str()))
                .collect()
        } else {
            let mut plan = Vec::new();
            let mut planned = HashSet::new();
            for id in &requested {
                if is_enabled(id.as_str()) || planned.contains(id.as_str()) {
                    continue;
                }
                if let Some(descriptor) = descriptors.get(id) {
                    for dependency in descriptor.dependency_ids() {
                        if !is_enabled(dependency) && !planned.contains(dependency) {
                            return Err(LifecycleError::UnmetDependency {
                                extension: id.clone(),
                                dependency: dependency.to_string(),
                            });
                        }
                    }
                }
                planned.insert(id.as_str());
                plan.push(id.clone());
            }
            plan
        };

        if plan.is_empty() {
            return Ok(plan);
        }

        let mut journal = Journal::new(&self.registry, self.migrator.as_ref());
        let mut installed = Vec::new();
        if let Err(err) = self.enable_sequence(&plan, &descriptors, &mut journal, &mut installed) {
            return Err(self.abort("enable", journal, err));
        }

        info!(
            "event=extension_enable module=lifecycle status=ok count={} ids={}",
            plan.len(),
            plan.join(",")
        );
        if !installed.is_empty() {
            self.broadcast(HOOK_MODULES_INSTALLED, &installed);
        }
        self.broadcast(HOOK_MODULES_ENABLED, &plan);
        Ok(plan)
    }

    /// Disables `ids`; with `cascade`, enabled dependents go first.
    ///
    /// Returns the ids that changed state, in deactivation order.
    pub fn disable<I, S>(&self, ids: I, cascade: bool) -> LifecycleResult<Vec<ExtensionId>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let _guard = self.lock();
        let requested: Vec<ExtensionId> = ids.into_iter().map(|id| id.as_ref().to_string()).collect();
        let descriptors = self.registry.descriptors();
        let records = self.registry.records()?;
        for id in &requested {
            if !records.contains_key(id) {
                return Err(LifecycleError::UnknownExtension(id.clone()));
            }
            if is_required(&descriptors, &records, id) {
                return Err(LifecycleError::RequiredExtension(id.clone()));
            }
        }

        let is_enabled = |id: &str| records.get(id).is_some_and(ExtensionRecord::is_enabled);
        let targets: BTreeSet<ExtensionId> = requested
            .iter()
            .filter(|id| is_enabled(id.as_str()))
            .cloned()
            .collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let resolver = self.registry.resolver(&descriptors)?;
        let mut closure = targets.clone();
        for id in &targets {
            let dependents: Vec<ExtensionId> = resolver
                .dependents_of(id)
                .into_iter()
                .filter(|dependent| is_enabled(dependent.as_str()) && !targets.contains(dependent))
                .collect();
            if dependents.is_empty() {
                continue;
            }
            if !cascade {
                return Err(LifecycleError::DependentsStillEnabled {
                    extension: id.clone(),
                    dependents,
                });
            }
            closure.extend(dependents);
        }
        for id in &closure {
            if is_required(&descriptors, &records, id) {
                return Err(LifecycleError::RequiredExtension(id.clone()));
            }
        }

        let order = reverse_activation_order(&resolver, &descriptors, &closure)?;
        let mut journal = Journal::new(&self.registry, self.migrator.as_ref());
        for id in &order {
            let result = self.registry.get(id).map_err(LifecycleError::from).and_then(|mut record| {
                record.status = ExtensionStatus::Disabled;
                record.changed_at = now_millis();
                journal.write(&record)?;
                self.invoke_reported(id, HOOK_DISABLE, &json!({ "extension": id }));
                Ok(())
            });
            if let Err(err) = result {
                return Err(self.abort("disable", journal, err));
            }
        }

        info!(
            "event=extension_disable module=lifecycle status=ok count={} ids={}",
            order.len(),
            order.join(",")
        );
        self.broadcast(HOOK_MODULES_DISABLED, &order);
        Ok(order)
    }

    /// Uninstalls disabled extensions, dependents first.
    ///
    /// Returns the ids whose schema was removed.
    pub fn uninstall<I, S>(&self, ids: I) -> LifecycleResult<Vec<ExtensionId>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let _guard = self.lock();
        let requested: Vec<ExtensionId> = ids.into_iter().map(|id| id.as_ref().to_string()).collect();
        let descriptors = self.registry.descriptors();
        let records = self.registry.records()?;
        for id in &requested {
            let Some(record) = records.get(id) else {
                return Err(LifecycleError::UnknownExtension(id.clone()));
            };
            if is_required(&descriptors, &records, id) {
                return Err(LifecycleError::RequiredExtension(id.clone()));
            }
            if record.is_enabled() {
                return Err(LifecycleError::NotDisabled(id.clone()));
            }
        }

        let targets: BTreeSet<ExtensionId> = requested
            .into_iter()
            .filter(|id| records.get(id).is_some_and(ExtensionRecord::is_installed))
            .collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        for id in &targets {
            let dependents: Vec<ExtensionId> = descriptors
                .values()
                .filter(|descriptor| {
                    !targets.contains(&descriptor.id)
                        && descriptor.depends_on(id)
                        && records
                            .get(&descriptor.id)
                            .is_some_and(ExtensionRecord::is_installed)
                })
                .map(|descriptor| descriptor.id.clone())
                .collect();
            if !dependents.is_empty() {
                return Err(LifecycleError::UninstallBlocked {
                    extension: id.clone(),
                    dependents,
                });
            }
        }

        let resolver = self.registry.resolver(&descriptors)?;
        let order = reverse_activation_order(&resolver, &descriptors, &targets)?;
        let mut journal = Journal::new(&self.registry, self.migrator.as_ref());
        for id in &order {
            if let Err(err) = self.uninstall_one(id, &mut journal) {
                return Err(self.abort("uninstall", journal, err));
            }
        }

        info!(
            "event=extension_uninstall module=lifecycle status=ok count={} ids={}",
            order.len(),
            order.join(",")
        );
        self.broadcast(HOOK_MODULES_UNINSTALLED, &order);
        Ok(order)
    }

    fn enable_sequence(
        &self,
        plan: &[ExtensionId],
        descriptors: &DescriptorSet,
        journal: &mut Journal<'_>,
        installed: &mut Vec<ExtensionId>,
    ) -> LifecycleResult<()> {
        for id in plan {
            if self.install_one(id, descriptors, journal)? {
                installed.push(id.clone());
            }
            let mut record = self.registry.get(id)?;
            record.status = ExtensionStatus::Enabled;
            record.bootstrap = self.bootstrap_flags(id);
            record.changed_at = now_millis();
            journal.write(&record)?;
            self.invoke_reported(id, HOOK_ENABLE, &json!({ "extension": id }));
        }
        Ok(())
    }

    /// Returns `true` when the extension went from uninstalled to installed.
    fn install_one(
        &self,
        id: &str,
        descriptors: &DescriptorSet,
        journal: &mut Journal<'_>,
    ) -> LifecycleResult<bool> {
        let descriptor = descriptors
            .get(id)
            .ok_or_else(|| LifecycleError::UnknownExtension(id.to_string()))?;
        let mut record = self.registry.get(id)?;
        if record.is_installed() {
            return Ok(false);
        }

        for dependency in descriptor.dependency_ids() {
            let dependency_installed = self
                .registry
                .find(dependency)?
                .is_some_and(|record| record.is_installed());
            if !dependency_installed {
                return Err(LifecycleError::MissingDependency {
                    extension: id.to_string(),
                    dependency: dependency.to_string(),
                });
            }
        }

        self.check_requirements(id)?;

        self.migrator
            .install(id, descriptor.schema_version)
            .map_err(|message| LifecycleError::Migration {
                extension: id.to_string(),
                message,
            })?;
        journal.schema_installed(id);

        let now = now_millis();
        record.schema_version = descriptor.schema_version;
        record.installed_at = Some(now);
        record.changed_at = now;
        journal.write(&record)?;

        if self.probe.invokable(id, HOOK_INSTALL) {
            self.probe
                .invoke(id, HOOK_INSTALL, &json!({ "extension": id }))?;
        }
        info!(
            "event=extension_install module=lifecycle status=ok id={} schema_version={}",
            id, descriptor.schema_version
        );
        Ok(true)
    }

    fn uninstall_one(&self, id: &str, journal: &mut Journal<'_>) -> LifecycleResult<()> {
        let mut record = self.registry.get(id)?;
        self.invoke_reported(id, HOOK_UNINSTALL, &json!({ "extension": id }));

        self.migrator
            .uninstall(id)
            .map_err(|message| LifecycleError::Migration {
                extension: id.to_string(),
                message,
            })?;
        journal.schema_removed(id, record.schema_version);

        record.schema_version = SCHEMA_UNINSTALLED;
        record.installed_at = None;
        record.bootstrap.clear();
        record.changed_at = now_millis();
        journal.write(&record)
    }

    /// Runs the `requirements` hook for the install phase.
    fn check_requirements(&self, id: &str) -> LifecycleResult<()> {
        if !self.probe.invokable(id, HOOK_REQUIREMENTS) {
            return Ok(());
        }
        let report = self
            .probe
            .invoke(id, HOOK_REQUIREMENTS, &json!({ "phase": "install" }))?;

        let entries: Vec<&Value> = match report.as_ref() {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(Value::Object(items)) => items.values().collect(),
            _ => Vec::new(),
        };
        let messages: Vec<String> = entries
            .into_iter()
            .filter(|entry| entry.get("severity").and_then(Value::as_str) == Some("error"))
            .map(|entry| {
                entry
                    .get("description")
                    .or_else(|| entry.get("title"))
                    .and_then(Value::as_str)
                    .unwrap_or("unmet requirement")
                    .to_string()
            })
            .collect();

        if messages.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::RequirementsNotMet {
                extension: id.to_string(),
                messages,
            })
        }
    }

    fn bootstrap_flags(&self, id: &str) -> BTreeSet<BootstrapHook> {
        BootstrapHook::ALL
            .into_iter()
            .filter(|hook| self.probe.invokable(id, hook.hook_name()))
            .collect()
    }

    /// Invokes a per-extension hook whose failure does not abort the call.
    fn invoke_reported(&self, id: &str, hook: &str, args: &Value) {
        if !self.probe.invokable(id, hook) {
            return;
        }
        if let Err(err) = self.probe.invoke(id, hook, args) {
            self.errors.report(&err);
        }
    }

    fn broadcast(&self, hook: &str, ids: &[ExtensionId]) {
        if let Err(err) = self.dispatcher.invoke_all(hook, &json!(ids)) {
            warn!(
                "event=lifecycle_broadcast module=lifecycle status=error hook={} error={}",
                hook, err
            );
        }
    }

    fn abort(&self, operation: &str, journal: Journal<'_>, err: LifecycleError) -> LifecycleError {
        warn!(
            "event=extension_{} module=lifecycle status=error error={}",
            operation, err
        );
        journal.rollback();
        err
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_required(
    descriptors: &DescriptorSet,
    records: &BTreeMap<ExtensionId, ExtensionRecord>,
    id: &str,
) -> bool {
    match descriptors.get(id) {
        Some(descriptor) => descriptor.required,
        None => records
            .get(id)
            .and_then(|record| record.info.get("required"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Deactivation order: dependents before their dependencies.
///
/// Ids without a descriptor cannot be ordered and go first, by id.
fn reverse_activation_order(
    resolver: &DependencyResolver<'_>,
    descriptors: &DescriptorSet,
    ids: &BTreeSet<ExtensionId>,
) -> LifecycleResult<Vec<ExtensionId>> {
    let (known, orphaned): (Vec<&ExtensionId>, Vec<&ExtensionId>) =
        ids.iter().partition(|id| descriptors.contains_key(*id));
    let mut order: Vec<ExtensionId> = orphaned.into_iter().cloned().collect();
    let mut ordered = resolver.order_exact(known)?;
    ordered.reverse();
    order.extend(ordered);
    Ok(order)
}
