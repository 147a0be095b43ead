//! Processed action model.
//!
//! [`ActionConfig`] is the immutable, validated form an action takes once the
//! graph builder has parsed references, merged implicit dependencies and
//! computed the content version. Its `spec` may still carry template
//! expressions for values that only materialise at execution time (dependency
//! outputs, runtime context); [`ResolvedAction`] is the fully evaluated form
//! produced lazily per task.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde_json::Value;

use garden_config::{ActionKind, ActionRef};

/// An action after graph building: reference, dependencies and version are
/// final; the spec may retain runtime template expressions.
#[derive(Debug, Clone)]
pub struct ActionConfig {
    pub reference: ActionRef,
    /// Provider type implementing this action (e.g. `exec`, `container`).
    pub type_name: String,
    pub description: Option<String>,
    /// Directory the action's sources live in; watched in dev mode.
    pub source_path: PathBuf,
    /// Effective dependencies: declared, `build:` and template-implied,
    /// deduplicated and sorted.
    pub dependencies: Vec<ActionRef>,
    /// The Build action named by the `build:` field, when present.
    pub explicit_build: Option<ActionRef>,
    /// Partially resolved spec.
    pub spec: Value,
    pub disabled: bool,
    /// Timeout in seconds for tasks on this action.
    pub timeout: Option<u64>,
    pub variables: Value,
    /// Every context key path the spec references.
    pub template_refs: BTreeSet<String>,
    /// Watch excludes local to this action.
    pub exclude: Vec<String>,
    /// Content version (stable hash of spec + dependency versions).
    pub version: String,
}

impl ActionConfig {
    pub fn kind(&self) -> ActionKind {
        self.reference.kind
    }

    pub fn name(&self) -> &str {
        &self.reference.name
    }

    /// Dependencies of a given kind, in stable order.
    pub fn dependencies_of_kind(&self, kind: ActionKind) -> impl Iterator<Item = &ActionRef> {
        self.dependencies.iter().filter(move |r| r.kind == kind)
    }
}

/// An action whose spec has been fully evaluated against the current context.
#[derive(Debug, Clone)]
pub struct ResolvedAction {
    pub config: ActionConfig,
    /// The fully resolved spec (no template expressions remain).
    pub spec: Value,
}

impl ResolvedAction {
    pub fn reference(&self) -> &ActionRef {
        &self.config.reference
    }

    pub fn kind(&self) -> ActionKind {
        self.config.kind()
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }
}
