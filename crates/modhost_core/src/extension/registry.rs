//! Extension registry over the persistent record store.
//!
//! # Responsibility
//! - Reconcile discovered descriptors with persisted records.
//! - Answer enabled-set queries in dispatch order.
//! - Invalidate the hook index whenever the enabled set changes.
//!
//! # Invariants
//! - Every descriptor passed to `refresh` has a record afterwards.
//! - `list_enabled` is ordered by weight ascending, then id.
//! - Only `apply_transition` writes lifecycle columns.

use crate::extension::descriptor::DescriptorSet;
use crate::extension::resolver::DependencyResolver;
use crate::hook::index::HookIndex;
use crate::model::extension::{
    ExtensionId, ExtensionKind, ExtensionRecord, RawDescriptor, PROFILE_WEIGHT,
};
use crate::repo::extension_repo::{ExtensionStore, RepoError};
use log::{info, warn};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug)]
pub enum RegistryError {
    NotFound(ExtensionId),
    Repo(RepoError),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "unknown extension: {id}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::NotFound(_) => None,
            Self::Repo(err) => Some(err),
        }
    }
}

impl From<RepoError> for RegistryError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound(id) => Self::NotFound(id),
            other => Self::Repo(other),
        }
    }
}

/// Filter for `list_enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    All,
    /// Only extensions with at least one bootstrap flag.
    BootstrapOnly,
}

/// Outcome counters of one `refresh`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub discovered: usize,
    pub updated: usize,
    pub orphaned: usize,
}

/// Registry of known extensions and their lifecycle records.
pub struct ExtensionRegistry {
    store: Arc<dyn ExtensionStore>,
    descriptors: RwLock<Arc<DescriptorSet>>,
    hook_index: Arc<HookIndex>,
}

impl ExtensionRegistry {
    pub fn new(store: Arc<dyn ExtensionStore>, hook_index: Arc<HookIndex>) -> Self {
        Self {
            store,
            descriptors: RwLock::new(Arc::new(DescriptorSet::new())),
            hook_index,
        }
    }

    pub fn hook_index(&self) -> &Arc<HookIndex> {
        &self.hook_index
    }

    /// Reconciles a descriptor scan with the stored records.
    ///
    /// New ids get a `Disabled`, uninstalled record. Existing records keep
    /// their lifecycle state and only take descriptor-derived columns.
    /// Records without a descriptor are kept and counted as orphaned.
    pub fn refresh(&self, descriptors: DescriptorSet) -> RegistryResult<RefreshSummary> {
        let mut summary = RefreshSummary::default();

        for descriptor in descriptors.values() {
            match self.store.get(&descriptor.id)? {
                None => {
                    let mut record = ExtensionRecord::discovered(descriptor);
                    record.changed_at = now_millis();
                    if record.kind == ExtensionKind::Profile {
                        record.weight = PROFILE_WEIGHT;
                    }
                    self.store.put(&record)?;
                    summary.discovered += 1;
                }
                Some(existing) => {
                    let mut record = existing.clone();
                    record.refresh_from(descriptor);
                    if record.kind == ExtensionKind::Profile {
                        record.weight = PROFILE_WEIGHT;
                    }
                    if record != existing {
                        self.store.put(&record)?;
                        summary.updated += 1;
                    }
                }
            }
        }

        for record in self.store.list()? {
            if !descriptors.contains_key(&record.id) {
                summary.orphaned += 1;
                if record.is_enabled() {
                    warn!(
                        "event=registry_refresh module=registry status=orphaned id={}",
                        record.id
                    );
                }
            }
        }

        *self.descriptors.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(descriptors);
        self.hook_index.invalidate();
        info!(
            "event=registry_refresh module=registry status=ok discovered={} updated={} orphaned={}",
            summary.discovered, summary.updated, summary.orphaned
        );
        Ok(summary)
    }

    /// Snapshot of the descriptors from the last `refresh`.
    pub fn descriptors(&self) -> Arc<DescriptorSet> {
        Arc::clone(&self.descriptors.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn descriptor(&self, id: &str) -> Option<RawDescriptor> {
        self.descriptors().get(id).cloned()
    }

    pub fn get(&self, id: &str) -> RegistryResult<ExtensionRecord> {
        self.find(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn find(&self, id: &str) -> RegistryResult<Option<ExtensionRecord>> {
        Ok(self.store.get(id)?)
    }

    /// Whether `id` is currently enabled.
    pub fn exists(&self, id: &str) -> RegistryResult<bool> {
        Ok(self
            .hook_index
            .enabled(self)?
            .iter()
            .any(|enabled| enabled == id))
    }

    /// All records keyed by id.
    pub fn records(&self) -> RegistryResult<BTreeMap<ExtensionId, ExtensionRecord>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect())
    }

    /// Persisted weight of every known record.
    pub fn weights(&self) -> RegistryResult<BTreeMap<ExtensionId, i32>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|record| (record.id, record.weight))
            .collect())
    }

    /// Enabled records ordered by weight ascending, then id.
    pub fn list_enabled(&self, kind: ListKind) -> RegistryResult<Vec<ExtensionRecord>> {
        let mut enabled: Vec<ExtensionRecord> = self
            .store
            .list()?
            .into_iter()
            .filter(ExtensionRecord::is_enabled)
            .filter(|record| kind == ListKind::All || !record.bootstrap.is_empty())
            .collect();
        enabled.sort_by(|left, right| {
            left.weight
                .cmp(&right.weight)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(enabled)
    }

    /// Changes the dispatch weight of one extension.
    ///
    /// Profiles keep their fixed weight.
    pub fn set_weight(&self, id: &str, weight: i32) -> RegistryResult<()> {
        let mut record = self.get(id)?;
        if record.kind == ExtensionKind::Profile {
            return Ok(());
        }
        record.weight = weight;
        self.apply_transition(&record)
    }

    /// Resolver over the current descriptors and persisted weights.
    ///
    /// The caller keeps the descriptor snapshot alive for the resolver.
    pub fn resolver<'a>(
        &self,
        descriptors: &'a DescriptorSet,
    ) -> RegistryResult<DependencyResolver<'a>> {
        Ok(DependencyResolver::new(descriptors).with_weights(self.weights()?))
    }

    /// Writes one record and invalidates the hook index when the enabled
    /// set or its order changed.
    pub(crate) fn apply_transition(&self, record: &ExtensionRecord) -> RegistryResult<()> {
        let previous = self.store.get(&record.id)?;
        self.store.put(record)?;

        let reorders = previous.map_or(true, |previous| {
            previous.status != record.status
                || previous.weight != record.weight
                || previous.bootstrap != record.bootstrap
        });
        if reorders {
            self.hook_index.invalidate();
        }
        Ok(())
    }
}

/// Epoch milliseconds used for `installed_at`/`changed_at`.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{ExtensionRegistry, ListKind, RegistryError};
    use crate::extension::descriptor::DescriptorSet;
    use crate::hook::index::HookIndex;
    use crate::hook::probe::HookTable;
    use crate::model::extension::{
        ExtensionKind, ExtensionStatus, RawDescriptor, PROFILE_WEIGHT,
    };
    use crate::repo::extension_repo::MemoryExtensionStore;
    use std::sync::Arc;

    fn registry() -> ExtensionRegistry {
        let index = Arc::new(HookIndex::new(Arc::new(HookTable::new())));
        ExtensionRegistry::new(Arc::new(MemoryExtensionStore::new()), index)
    }

    fn descriptors(entries: &[(&str, i32)]) -> DescriptorSet {
        entries
            .iter()
            .map(|(id, weight)| {
                let mut descriptor = RawDescriptor::new(*id, id.to_uppercase());
                descriptor.weight = *weight;
                (id.to_string(), descriptor)
            })
            .collect()
    }

    fn enable(registry: &ExtensionRegistry, id: &str) {
        let mut record = registry.get(id).expect("record exists");
        record.schema_version = 0;
        record.status = ExtensionStatus::Enabled;
        registry.apply_transition(&record).expect("transition");
    }

    #[test]
    fn refresh_creates_disabled_uninstalled_records() {
        let registry = registry();
        let summary = registry
            .refresh(descriptors(&[("node", 0), ("user", 0)]))
            .expect("refresh");
        assert_eq!(summary.discovered, 2);

        let node = registry.get("node").expect("node record");
        assert_eq!(node.status, ExtensionStatus::Disabled);
        assert!(!node.is_installed());
        assert_eq!(node.name, "NODE");
    }

    #[test]
    fn refresh_keeps_lifecycle_state_of_existing_records() {
        let registry = registry();
        registry.refresh(descriptors(&[("node", 0)])).expect("refresh");
        enable(&registry, "node");

        let mut renamed = descriptors(&[("node", 0)]);
        renamed.get_mut("node").expect("node").name = "Content".to_string();
        let summary = registry.refresh(renamed).expect("second refresh");

        assert_eq!(summary.updated, 1);
        let node = registry.get("node").expect("node record");
        assert_eq!(node.name, "Content");
        assert!(node.is_enabled());
    }

    #[test]
    fn refresh_counts_records_without_descriptor() {
        let registry = registry();
        registry
            .refresh(descriptors(&[("node", 0), ("legacy", 0)]))
            .expect("refresh");
        let summary = registry.refresh(descriptors(&[("node", 0)])).expect("refresh");
        assert_eq!(summary.orphaned, 1);
        assert!(registry.get("legacy").is_ok());
    }

    #[test]
    fn profile_records_get_fixed_weight() {
        let registry = registry();
        let mut set = descriptors(&[("standard", 5)]);
        set.get_mut("standard").expect("profile").kind = ExtensionKind::Profile;
        registry.refresh(set).expect("refresh");

        assert_eq!(registry.get("standard").expect("profile").weight, PROFILE_WEIGHT);
        registry.set_weight("standard", -10).expect("set weight");
        assert_eq!(registry.get("standard").expect("profile").weight, PROFILE_WEIGHT);
    }

    #[test]
    fn list_enabled_orders_by_weight_then_id() {
        let registry = registry();
        registry
            .refresh(descriptors(&[("b", 0), ("a", 0), ("heavy", -5), ("off", -10)]))
            .expect("refresh");
        for id in ["a", "b", "heavy"] {
            enable(&registry, id);
        }

        let order: Vec<String> = registry
            .list_enabled(ListKind::All)
            .expect("list")
            .into_iter()
            .map(|record| record.id)
            .collect();
        assert_eq!(order, vec!["heavy", "a", "b"]);
        assert!(registry
            .list_enabled(ListKind::BootstrapOnly)
            .expect("bootstrap list")
            .is_empty());
    }

    #[test]
    fn transitions_invalidate_hook_index() {
        let registry = registry();
        registry.refresh(descriptors(&[("node", 0)])).expect("refresh");
        assert!(!registry.exists("node").expect("exists"));

        let epoch = registry.hook_index().epoch();
        enable(&registry, "node");
        assert!(registry.hook_index().epoch() > epoch);
        assert!(registry.exists("node").expect("exists"));
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let registry = registry();
        assert!(matches!(registry.get("ghost"), Err(RegistryError::NotFound(_))));
        assert!(matches!(
            registry.set_weight("ghost", 1),
            Err(RegistryError::NotFound(_))
        ));
    }
}
