//! Cached implementer lists per hook.
//!
//! # Responsibility
//! - Compute, for one hook, the enabled extensions whose probe answers yes.
//! - Cache the result until the registry reports an enabled-set change.
//!
//! # Invariants
//! - Entries are ordered like `ExtensionRegistry::list_enabled(All)`, then
//!   placement overrides are applied.
//! - A rebuild that raced with `invalidate` is returned to its caller but
//!   never cached.

use crate::extension::registry::{ExtensionRegistry, ListKind, RegistryResult};
use crate::hook::probe::HookProbe;
use crate::hook::HookName;
use crate::model::extension::ExtensionId;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Forced position of one implementer inside a hook's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    First,
    Last,
}

#[derive(Default)]
struct IndexState {
    epoch: u64,
    enabled: Option<Arc<[ExtensionId]>>,
    entries: HashMap<HookName, Arc<[ExtensionId]>>,
    placements: HashMap<HookName, Vec<(ExtensionId, Placement)>>,
}

/// Lazily built `hook -> implementers` cache.
pub struct HookIndex {
    probe: Arc<dyn HookProbe>,
    state: RwLock<IndexState>,
}

impl HookIndex {
    pub fn new(probe: Arc<dyn HookProbe>) -> Self {
        Self {
            probe,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn probe(&self) -> &Arc<dyn HookProbe> {
        &self.probe
    }

    /// Current cache generation; bumped by every invalidation.
    pub fn epoch(&self) -> u64 {
        self.read().epoch
    }

    /// Drops every cached entry. Placement overrides survive.
    pub fn invalidate(&self) {
        let mut state = self.write();
        state.epoch += 1;
        state.enabled = None;
        state.entries.clear();
        debug!(
            "event=hook_index_invalidate module=hook status=ok epoch={}",
            state.epoch
        );
    }

    /// Forces `extension` to run first or last for `hook`.
    ///
    /// Later calls for the same hook are applied after earlier ones.
    pub fn set_placement(&self, hook: &str, extension: &str, placement: Placement) {
        let mut state = self.write();
        let overrides = state.placements.entry(hook.to_string()).or_default();
        overrides.retain(|(id, _)| id != extension);
        overrides.push((extension.to_string(), placement));
        state.epoch += 1;
        state.entries.remove(hook);
    }

    /// Enabled extension ids in dispatch order, cached.
    pub fn enabled(&self, registry: &ExtensionRegistry) -> RegistryResult<Arc<[ExtensionId]>> {
        let epoch = {
            let state = self.read();
            if let Some(enabled) = state.enabled.as_ref() {
                return Ok(Arc::clone(enabled));
            }
            state.epoch
        };
        self.load_enabled(epoch, registry)
    }

    /// Ordered implementers of `hook` among enabled extensions.
    pub fn implementers_of(
        &self,
        hook: &str,
        registry: &ExtensionRegistry,
    ) -> RegistryResult<Arc<[ExtensionId]>> {
        let (epoch, enabled, placements) = {
            let state = self.read();
            if let Some(entry) = state.entries.get(hook) {
                return Ok(Arc::clone(entry));
            }
            (
                state.epoch,
                state.enabled.clone(),
                state.placements.get(hook).cloned().unwrap_or_default(),
            )
        };

        let enabled = match enabled {
            Some(enabled) => enabled,
            None => self.load_enabled(epoch, registry)?,
        };

        let mut implementers: Vec<ExtensionId> = enabled
            .iter()
            .filter(|id| self.probe.implements(id, hook))
            .cloned()
            .collect();
        apply_placements(&mut implementers, &placements);
        let entry: Arc<[ExtensionId]> = implementers.into();

        let mut state = self.write();
        if state.epoch == epoch {
            state.entries.insert(hook.to_string(), Arc::clone(&entry));
            debug!(
                "event=hook_index_build module=hook status=ok hook={} implementers={}",
                hook,
                entry.len()
            );
        } else {
            debug!(
                "event=hook_index_build module=hook status=stale hook={} epoch={}",
                hook, epoch
            );
        }
        Ok(entry)
    }

    fn load_enabled(
        &self,
        epoch: u64,
        registry: &ExtensionRegistry,
    ) -> RegistryResult<Arc<[ExtensionId]>> {
        let enabled: Arc<[ExtensionId]> = registry
            .list_enabled(ListKind::All)?
            .into_iter()
            .map(|record| record.id)
            .collect::<Vec<_>>()
            .into();

        let mut state = self.write();
        if state.epoch == epoch {
            state.enabled = Some(Arc::clone(&enabled));
        }
        Ok(enabled)
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_placements(implementers: &mut Vec<ExtensionId>, placements: &[(ExtensionId, Placement)]) {
    for (extension, placement) in placements {
        let Some(position) = implementers.iter().position(|id| id == extension) else {
            continue;
        };
        let id = implementers.remove(position);
        match placement {
            Placement::First => implementers.insert(0, id),
            Placement::Last => implementers.push(id),
        }
    }
}
