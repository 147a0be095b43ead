//! The immutable Config Graph: a DAG over actions with typed edges.

pub(crate) mod builder;

pub use builder::{ActionInfoContext, GraphBuilder};

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use garden_config::{ActionKind, ActionRef};

use crate::actions::ActionConfig;
use crate::error::GardenError;

/// Immutable DAG over actions. Edges point from an action to the actions it
/// depends on; a reverse index serves dependant queries.
#[derive(Debug, Clone, Default)]
pub struct ConfigGraph {
    actions: BTreeMap<ActionRef, ActionConfig>,
    /// `a -> deps(a)`
    edges: BTreeMap<ActionRef, BTreeSet<ActionRef>>,
    /// `a -> dependants(a)`
    reverse: BTreeMap<ActionRef, BTreeSet<ActionRef>>,
    /// Topological order, dependencies first.
    order: Vec<ActionRef>,
}

impl ConfigGraph {
    pub(crate) fn from_parts(
        actions: BTreeMap<ActionRef, ActionConfig>,
        order: Vec<ActionRef>,
    ) -> Self {
        let mut edges: BTreeMap<ActionRef, BTreeSet<ActionRef>> = BTreeMap::new();
        let mut reverse: BTreeMap<ActionRef, BTreeSet<ActionRef>> = BTreeMap::new();
        for (reference, config) in &actions {
            edges.entry(reference.clone()).or_default();
            reverse.entry(reference.clone()).or_default();
            for dep in &config.dependencies {
                edges
                    .entry(reference.clone())
                    .or_default()
                    .insert(dep.clone());
                reverse
                    .entry(dep.clone())
                    .or_default()
                    .insert(reference.clone());
            }
        }
        Self {
            actions,
            edges,
            reverse,
            order,
        }
    }

    /// Look up a single action.
    pub fn get(&self, reference: &ActionRef) -> Result<&ActionConfig, GardenError> {
        self.actions
            .get(reference)
            .ok_or_else(|| GardenError::NotFound(format!("action {}", reference)))
    }

    pub fn contains(&self, reference: &ActionRef) -> bool {
        self.actions.contains_key(reference)
    }

    /// All enabled actions, optionally filtered by refs and kind.
    pub fn get_actions(
        &self,
        refs: Option<&[ActionRef]>,
        kind: Option<ActionKind>,
    ) -> Vec<&ActionConfig> {
        self.actions
            .values()
            .filter(|a| !a.disabled)
            .filter(|a| kind.map(|k| a.kind() == k).unwrap_or(true))
            .filter(|a| {
                refs.map(|wanted| wanted.contains(&a.reference))
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Every action including disabled ones (disabled actions stay available
    /// for reference resolution).
    pub fn all_actions(&self) -> impl Iterator<Item = &ActionConfig> {
        self.actions.values()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Topological order, dependencies first.
    pub fn topo_order(&self) -> &[ActionRef] {
        &self.order
    }

    /// Direct or transitive dependencies of an action.
    pub fn get_dependencies(&self, reference: &ActionRef, recursive: bool) -> Vec<ActionRef> {
        self.walk(reference, &self.edges, recursive)
    }

    /// Direct or transitive dependants of an action.
    pub fn get_dependants(&self, reference: &ActionRef, recursive: bool) -> Vec<ActionRef> {
        self.walk(reference, &self.reverse, recursive)
    }

    /// Union of dependants over several actions.
    pub fn get_dependants_for_many(
        &self,
        refs: &[ActionRef],
        recursive: bool,
    ) -> Vec<ActionRef> {
        let mut out = BTreeSet::new();
        for reference in refs {
            out.extend(self.get_dependants(reference, recursive));
        }
        out.into_iter().collect()
    }

    fn walk(
        &self,
        start: &ActionRef,
        index: &BTreeMap<ActionRef, BTreeSet<ActionRef>>,
        recursive: bool,
    ) -> Vec<ActionRef> {
        let mut seen: BTreeSet<ActionRef> = BTreeSet::new();
        let mut queue: VecDeque<ActionRef> = index
            .get(start)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if recursive {
                if let Some(more) = index.get(&next) {
                    queue.extend(more.iter().cloned());
                }
            }
        }
        seen.into_iter().collect()
    }
}
