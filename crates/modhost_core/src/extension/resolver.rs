//! Dependency resolution and deterministic activation ordering.
//!
//! # Responsibility
//! - Expand a request with its transitive dependencies.
//! - Detect missing dependencies, incompatible versions and cycles.
//! - Produce a topological order, dependencies first.
//!
//! # Invariants
//! - Pure: never reads or writes persisted state.
//! - Among ready nodes, lower weight goes first, then lower id.

use crate::extension::descriptor::DescriptorSet;
use crate::model::extension::{ExtensionId, RawDescriptor};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Resolution failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    UnknownExtension(ExtensionId),
    MissingDependency {
        requester: ExtensionId,
        missing: ExtensionId,
    },
    IncompatibleVersion {
        requester: ExtensionId,
        dependency: ExtensionId,
        constraint: String,
        found: String,
    },
    CyclicDependency {
        participants: Vec<ExtensionId>,
    },
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownExtension(id) => write!(f, "unknown extension: {id}"),
            Self::MissingDependency { requester, missing } => {
                write!(f, "extension `{requester}` requires missing extension `{missing}`")
            }
            Self::IncompatibleVersion {
                requester,
                dependency,
                constraint,
                found,
            } => write!(
                f,
                "extension `{requester}` requires `{dependency}` {constraint}, found {found}"
            ),
            Self::CyclicDependency { participants } => {
                write!(f, "dependency cycle: {}", participants.join(" -> "))
            }
        }
    }
}

impl Error for ResolveError {}

/// Full diagnostic result of one resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    /// Every node that could be ordered, dependencies first.
    pub order: Vec<ExtensionId>,
    /// Every problem found, in discovery order.
    pub problems: Vec<ResolveError>,
}

impl ResolutionReport {
    pub fn is_satisfiable(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Resolver over one descriptor snapshot and a weight table.
#[derive(Debug, Clone)]
pub struct DependencyResolver<'a> {
    descriptors: &'a DescriptorSet,
    weights: BTreeMap<ExtensionId, i32>,
}

impl<'a> DependencyResolver<'a> {
    /// Creates a resolver using each descriptor's declared weight.
    pub fn new(descriptors: &'a DescriptorSet) -> Self {
        Self {
            descriptors,
            weights: BTreeMap::new(),
        }
    }

    /// Overrides weights, typically with the persisted record weights.
    pub fn with_weights(mut self, weights: impl IntoIterator<Item = (ExtensionId, i32)>) -> Self {
        self.weights.extend(weights);
        self
    }

    fn weight(&self, id: &str) -> i32 {
        self.weights
            .get(id)
            .copied()
            .or_else(|| self.descriptors.get(id).map(|descriptor| descriptor.weight))
            .unwrap_or(0)
    }

    /// Orders the request plus its transitive dependencies.
    ///
    /// Fails with the first problem `report` would list.
    pub fn resolve<I, S>(&self, requested: I) -> Result<Vec<ExtensionId>, ResolveError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = self.report(requested);
        if report.problems.is_empty() {
            Ok(report.order)
        } else {
            Err(report.problems.remove(0))
        }
    }

    /// Collects every problem of a request instead of stopping at the first.
    pub fn report<I, S>(&self, requested: I) -> ResolutionReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut problems = Vec::new();
        let mut nodes = BTreeSet::<&str>::new();
        let mut stack = Vec::<&str>::new();

        let mut roots: Vec<String> = requested
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();
        roots.sort();
        roots.dedup();
        for id in &roots {
            match self.descriptors.get_key_value(id.as_str()) {
                Some((key, _)) => stack.push(key.as_str()),
                None => problems.push(ResolveError::UnknownExtension(id.clone())),
            }
        }

        while let Some(id) = stack.pop() {
            if !nodes.insert(id) {
                continue;
            }
            let Some(descriptor) = self.descriptors.get(id) else {
                continue;
            };
            for dependency in &descriptor.dependencies {
                let Some((key, target)) = self.descriptors.get_key_value(dependency.id.as_str())
                else {
                    problems.push(ResolveError::MissingDependency {
                        requester: id.to_string(),
                        missing: dependency.id.clone(),
                    });
                    continue;
                };
                if !dependency.accepts(target.version.as_ref()) {
                    problems.push(ResolveError::IncompatibleVersion {
                        requester: id.to_string(),
                        dependency: dependency.id.clone(),
                        constraint: dependency
                            .constraint
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                        found: target
                            .version
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                    });
                }
                if !nodes.contains(key.as_str()) {
                    stack.push(key.as_str());
                }
            }
        }

        let (order, cycle) = self.topological_order(&nodes);
        if let Some(participants) = cycle {
            problems.push(ResolveError::CyclicDependency { participants });
        }
        ResolutionReport { order, problems }
    }

    /// Orders exactly `ids` without expanding dependencies.
    ///
    /// Edges to extensions outside the set are ignored.
    pub fn order_exact<I, S>(&self, ids: I) -> Result<Vec<ExtensionId>, ResolveError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut nodes = BTreeSet::<&str>::new();
        for id in ids {
            match self.descriptors.get_key_value(id.as_ref()) {
                Some((key, _)) => {
                    nodes.insert(key.as_str());
                }
                None => return Err(ResolveError::UnknownExtension(id.as_ref().to_string())),
            }
        }
        match self.topological_order(&nodes) {
            (order, None) => Ok(order),
            (_, Some(participants)) => Err(ResolveError::CyclicDependency { participants }),
        }
    }

    /// Returns every extension that directly or transitively depends on `id`.
    pub fn dependents_of(&self, id: &str) -> BTreeSet<ExtensionId> {
        let mut reverse: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (dependent, descriptor) in self.descriptors {
            for dependency in descriptor.dependency_ids() {
                reverse.entry(dependency).or_default().push(dependent.as_str());
            }
        }

        let mut found = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for &dependent in reverse.get(current).into_iter().flatten() {
                if dependent != id && found.insert(dependent.to_string()) {
                    stack.push(dependent);
                }
            }
        }
        found
    }

    /// Returns every known extension `id` directly or transitively requires.
    pub fn dependencies_of(&self, id: &str) -> BTreeSet<ExtensionId> {
        let mut found = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(descriptor) = self.descriptors.get(current) else {
                continue;
            };
            for dependency in descriptor.dependency_ids() {
                if dependency != id
                    && self.descriptors.contains_key(dependency)
                    && found.insert(dependency.to_string())
                {
                    stack.push(dependency);
                }
            }
        }
        found
    }

    /// Kahn's algorithm over `nodes`; returns the ordered prefix and, when
    /// not every node could be ordered, one concrete cycle.
    fn topological_order(
        &self,
        nodes: &BTreeSet<&str>,
    ) -> (Vec<ExtensionId>, Option<Vec<ExtensionId>>) {
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for &id in nodes {
            let count = self
                .in_set_dependencies(id, nodes)
                .inspect(|&dependency| dependents.entry(dependency).or_default().push(id))
                .count();
            pending.insert(id, count);
        }

        let mut ready: BTreeSet<(i32, &str)> = pending
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&id, _)| (self.weight(id), id))
            .collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some((_, id)) = ready.pop_first() {
            order.push(id.to_string());
            pending.remove(id);
            for &dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert((self.weight(dependent), dependent));
                    }
                }
            }
        }

        if pending.is_empty() {
            (order, None)
        } else {
            let cycle = self.find_cycle(&pending);
            (order, Some(cycle))
        }
    }

    fn in_set_dependencies<'s>(
        &'s self,
        id: &str,
        nodes: &'s BTreeSet<&'s str>,
    ) -> impl Iterator<Item = &'s str> + 's {
        self.descriptors
            .get(id)
            .map(RawDescriptor::dependency_ids)
            .into_iter()
            .flatten()
            .filter_map(move |dependency| nodes.get(dependency).copied())
    }

    /// Follows unresolved dependency edges from the smallest unresolved id
    /// until a node repeats. Every unresolved node has an unresolved
    /// dependency, so the walk always closes.
    fn find_cycle(&self, unresolved: &BTreeMap<&str, usize>) -> Vec<ExtensionId> {
        let Some(&start) = unresolved.keys().next() else {
            return Vec::new();
        };
        let mut path: Vec<&str> = Vec::new();
        let mut position: BTreeMap<&str, usize> = BTreeMap::new();
        let mut current = start;

        loop {
            if let Some(&index) = position.get(current) {
                let mut cycle: Vec<ExtensionId> =
                    path[index..].iter().map(|id| id.to_string()).collect();
                if let Some(min_index) = cycle
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1.cmp(b.1))
                    .map(|(index, _)| index)
                {
                    cycle.rotate_left(min_index);
                }
                return cycle;
            }
            position.insert(current, path.len());
            path.push(current);

            let next = self.descriptors.get(current).and_then(|descriptor| {
                descriptor
                    .dependency_ids()
                    .find(|dependency| unresolved.contains_key(dependency))
            });
            match next {
                Some(dependency) => current = dependency,
                None => return path.iter().map(|id| id.to_string()).collect(),
            }
        }
    }
}
