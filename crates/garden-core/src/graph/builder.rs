//! Graph builder: resolves raw action configs into the immutable ConfigGraph.
//!
//! Pipeline: parse references, derive implicit dependencies from template
//! refs, validate edge rules, detect cycles, topologically order, partially
//! resolve every spec and seal content versions. Any failure yields a
//! configuration error and no graph.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use garden_config::{
    merge_variables, ActionKind, ActionRef, ProjectConfig, RawActionConfig,
};
use garden_template::{
    resolve_value, scan_value, ConfigContext, LayeredContext, Lookup, MapContext, PathSegment,
    ResolveOptions, ScanContext, TemplateError,
};

use crate::actions::ActionConfig;
use crate::error::GardenError;
use crate::graph::ConfigGraph;
use crate::version::content_version;

/// Static per-action facts available to templates before execution:
/// `actions.<kind>.<name>.name`, `.version` and `.disabled`. Output keys stay
/// partial until the producing task has run.
#[derive(Debug, Clone, Default)]
pub struct ActionInfoContext {
    info: BTreeMap<ActionRef, ActionInfo>,
}

#[derive(Debug, Clone)]
struct ActionInfo {
    version: String,
    disabled: bool,
}

impl ActionInfoContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, reference: ActionRef, version: String, disabled: bool) {
        self.info.insert(reference, ActionInfo { version, disabled });
    }
}

impl ConfigContext for ActionInfoContext {
    fn lookup(&self, path: &[PathSegment]) -> Result<Lookup, TemplateError> {
        let Some(reference) = parse_action_path(path) else {
            return Ok(Lookup::missing());
        };
        let field = match path.get(3) {
            Some(PathSegment::Key(k)) => k.as_str(),
            _ => return Ok(Lookup::missing_partial()),
        };
        match self.info.get(&reference) {
            Some(info) => Ok(match field {
                "name" => Lookup::Found(Value::String(reference.name.clone())),
                "version" => Lookup::Found(Value::String(info.version.clone())),
                "disabled" => Lookup::Found(Value::Bool(info.disabled)),
                // Outputs and anything else materialise at execution time.
                _ => Lookup::missing_partial(),
            }),
            None => Ok(Lookup::missing_partial()),
        }
    }
}

/// Parse `actions.<kind>.<name>` / `runtime.<kind>.<name>` path prefixes.
pub(crate) fn parse_action_path(path: &[PathSegment]) -> Option<ActionRef> {
    match path.first() {
        Some(PathSegment::Key(k)) if k == "actions" || k == "runtime" => {}
        _ => return None,
    }
    let kind = match path.get(1) {
        Some(PathSegment::Key(k)) => k.parse::<ActionKind>().ok()?,
        _ => return None,
    };
    let name = match path.get(2) {
        Some(PathSegment::Key(k)) => k.clone(),
        _ => return None,
    };
    Some(ActionRef::new(kind, name))
}

/// Builds the ConfigGraph from raw action configs.
pub struct GraphBuilder {
    project_name: String,
    environment: String,
    project_variables: Value,
    provider_outputs: Value,
    secrets: Value,
}

impl GraphBuilder {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            environment: "default".to_string(),
            project_variables: Value::Null,
            provider_outputs: Value::Null,
            secrets: Value::Null,
        }
    }

    /// Construct from a loaded project, merging environment variables.
    pub fn for_project(
        project: &ProjectConfig,
        environment: Option<&str>,
    ) -> Result<Self, GardenError> {
        let env = project.environment(environment)?;
        let (env_name, env_vars) = match env {
            Some(e) => (e.name.clone(), e.variables.clone()),
            None => ("default".to_string(), Value::Null),
        };
        Ok(Self {
            project_name: project.name.clone(),
            environment: env_name,
            project_variables: merge_variables(&project.variables, &env_vars),
            provider_outputs: Value::Null,
            secrets: Value::Null,
        })
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.project_variables = variables;
        self
    }

    pub fn with_provider_outputs(mut self, outputs: Value) -> Self {
        self.provider_outputs = outputs;
        self
    }

    /// Secret values available to templates under `secrets.*`. Secrets are
    /// static per environment, so they resolve fully at graph-build time.
    pub fn with_secrets(mut self, secrets: Value) -> Self {
        self.secrets = secrets;
        self
    }

    /// Assemble and validate the graph.
    pub fn build(&self, raw: Vec<RawActionConfig>) -> Result<ConfigGraph, GardenError> {
        let mut entries = self.prepare(raw)?;
        self.validate_edges(&entries)?;
        detect_cycles(&entries)?;
        let order = topo_sort(&entries);
        let actions = self.resolve_in_order(&mut entries, &order)?;
        tracing::debug!(actions = actions.len(), "config graph assembled");
        Ok(ConfigGraph::from_parts(actions, order))
    }

    /// Parse references, scan template refs and merge implicit dependencies.
    fn prepare(&self, raw: Vec<RawActionConfig>) -> Result<BTreeMap<ActionRef, Entry>, GardenError> {
        let mut entries = BTreeMap::new();
        for config in raw {
            let reference = config.reference()?;
            let mut dependencies: BTreeSet<ActionRef> =
                config.dependency_refs()?.into_iter().collect();

            let explicit_build = match &config.build {
                Some(name) => {
                    if reference.kind == ActionKind::Build {
                        return Err(GardenError::Configuration(format!(
                            "action {}: Build actions cannot declare a 'build' field",
                            reference
                        )));
                    }
                    let build_ref = ActionRef::build(name.clone());
                    dependencies.insert(build_ref.clone());
                    Some(build_ref)
                }
                None => None,
            };

            if let Some(copy_from) = &config.copy_from {
                dependencies.insert(ActionRef::build(copy_from.clone()));
            }

            // Template refs of the spec and variables, scanned without values.
            let scan = ScanContext::new();
            scan_value(&config.spec, &scan)?;
            scan_value(&config.variables, &scan)?;
            let template_refs = scan.found_keys();

            for key in &template_refs {
                if let Some(implied) = implicit_dependency(key) {
                    if implied != reference {
                        dependencies.insert(implied);
                    }
                }
                if let Some(secret) = key.strip_prefix("secrets.") {
                    let name = secret.split('.').next().unwrap_or(secret);
                    if self.secrets.get(name).is_none() {
                        return Err(GardenError::Configuration(format!(
                            "action {} references unknown secret '{}'",
                            reference, name
                        )));
                    }
                }
            }

            if dependencies.contains(&reference) {
                return Err(GardenError::Configuration(format!(
                    "action {} depends on itself",
                    reference
                )));
            }

            entries.insert(
                reference.clone(),
                Entry {
                    reference,
                    config,
                    dependencies,
                    explicit_build,
                    template_refs,
                },
            );
        }
        Ok(entries)
    }

    fn validate_edges(&self, entries: &BTreeMap<ActionRef, Entry>) -> Result<(), GardenError> {
        for entry in entries.values() {
            for dep in &entry.dependencies {
                let target = entries.get(dep).ok_or_else(|| {
                    GardenError::Configuration(format!(
                        "action {} (in {}) depends on unknown action {}",
                        entry.reference,
                        entry.config.source_path.display(),
                        dep
                    ))
                })?;
                // Builds only depend on builds; tests are terminal.
                if entry.reference.kind == ActionKind::Build && dep.kind != ActionKind::Build {
                    return Err(GardenError::Configuration(format!(
                        "Build action {} may only depend on other Build actions, found {}",
                        entry.reference, dep
                    )));
                }
                if target.reference.kind == ActionKind::Test {
                    return Err(GardenError::Configuration(format!(
                        "action {} cannot depend on Test action {}",
                        entry.reference, dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve specs in dependency order, sealing versions as we go.
    fn resolve_in_order(
        &self,
        entries: &mut BTreeMap<ActionRef, Entry>,
        order: &[ActionRef],
    ) -> Result<BTreeMap<ActionRef, ActionConfig>, GardenError> {
        let mut info = ActionInfoContext::new();
        let mut actions = BTreeMap::new();
        let opts = ResolveOptions::partial();

        for reference in order {
            let entry = entries
                .remove(reference)
                .ok_or_else(|| GardenError::Internal(format!("{} missing from entries", reference)))?;

            // Action variables may reference project variables.
            let base_ctx = self.base_context(&self.project_variables, &info);
            let resolved_vars = resolve_value(&entry.config.variables, &base_ctx, &opts)
                .map_err(|e| annotate(e, reference))?;
            let variables = merge_variables(&self.project_variables, &resolved_vars);

            let ctx = self.base_context(&variables, &info);
            let spec = resolve_value(&entry.config.spec, &ctx, &opts)
                .map_err(|e| annotate(e, reference))?;

            let dep_versions: Vec<String> = entry
                .dependencies
                .iter()
                .map(|dep| {
                    actions
                        .get(dep)
                        .map(|a: &ActionConfig| a.version.clone())
                        .ok_or_else(|| {
                            GardenError::Internal(format!(
                                "dependency {} of {} not resolved before dependant",
                                dep, reference
                            ))
                        })
                })
                .collect::<Result<_, _>>()?;
            let version = content_version(&spec, &dep_versions);
            info.insert(reference.clone(), version.clone(), entry.config.disabled);

            let config = ActionConfig {
                reference: reference.clone(),
                type_name: entry.config.type_name.clone(),
                description: entry.config.description.clone(),
                source_path: entry.config.source_path.clone(),
                dependencies: entry.dependencies.iter().cloned().collect(),
                explicit_build: entry.explicit_build.clone(),
                spec,
                disabled: entry.config.disabled,
                timeout: entry.config.timeout,
                variables,
                template_refs: entry.template_refs.clone(),
                exclude: entry.config.exclude.clone(),
                version,
            };
            actions.insert(reference.clone(), config);
        }
        Ok(actions)
    }

    /// Project/environment/var layers plus static action info and provider
    /// outputs, sealed in dependency order.
    fn base_context(&self, variables: &Value, info: &ActionInfoContext) -> LayeredContext {
        let mut project = serde_json::Map::new();
        project.insert(
            "project".to_string(),
            serde_json::json!({ "name": self.project_name }),
        );
        project.insert(
            "environment".to_string(),
            serde_json::json!({ "name": self.environment }),
        );
        project.insert("var".to_string(), variables.clone());
        if !self.secrets.is_null() {
            project.insert("secrets".to_string(), self.secrets.clone());
        }
        if !self.provider_outputs.is_null() {
            project.insert("providers".to_string(), self.provider_outputs.clone());
        }

        LayeredContext::new()
            .with_layer(Arc::new(MapContext::new(Value::Object(project))))
            .with_layer(Arc::new(info.clone()))
    }
}

struct Entry {
    reference: ActionRef,
    config: RawActionConfig,
    dependencies: BTreeSet<ActionRef>,
    explicit_build: Option<ActionRef>,
    template_refs: BTreeSet<String>,
}

fn annotate(err: TemplateError, reference: &ActionRef) -> GardenError {
    GardenError::Configuration(format!("resolving {}: {}", reference, err))
}

/// Derive an implicit dependency from a template ref key like
/// `actions.build.api.outputs.image-id`.
fn implicit_dependency(key: &str) -> Option<ActionRef> {
    let mut parts = key.split('.');
    let prefix = parts.next()?;
    if prefix != "actions" && prefix != "runtime" {
        return None;
    }
    let kind = parts.next()?.parse::<ActionKind>().ok()?;
    let name = parts.next()?;
    if name.is_empty() {
        return None;
    }
    Some(ActionRef::new(kind, name.to_string()))
}

/// DFS colouring; returns a configuration error naming every ref on the
/// cycle.
fn detect_cycles(entries: &BTreeMap<ActionRef, Entry>) -> Result<(), GardenError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        Grey,
        Black,
    }

    fn visit(
        node: &ActionRef,
        entries: &BTreeMap<ActionRef, Entry>,
        colours: &mut BTreeMap<ActionRef, Colour>,
        stack: &mut Vec<ActionRef>,
    ) -> Option<Vec<ActionRef>> {
        colours.insert(node.clone(), Colour::Grey);
        stack.push(node.clone());
        if let Some(entry) = entries.get(node) {
            for dep in &entry.dependencies {
                match colours.get(dep).copied().unwrap_or(Colour::White) {
                    Colour::Grey => {
                        // Slice the stack from the first occurrence of `dep`.
                        let start = stack.iter().position(|r| r == dep).unwrap_or(0);
                        let mut cycle: Vec<ActionRef> = stack[start..].to_vec();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Colour::White => {
                        if let Some(cycle) = visit(dep, entries, colours, stack) {
                            return Some(cycle);
                        }
                    }
                    Colour::Black => {}
                }
            }
        }
        stack.pop();
        colours.insert(node.clone(), Colour::Black);
        None
    }

    let mut colours: BTreeMap<ActionRef, Colour> = BTreeMap::new();
    for node in entries.keys() {
        if colours.get(node).copied().unwrap_or(Colour::White) == Colour::White {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(node, entries, &mut colours, &mut stack) {
                let rendered: Vec<String> = cycle.iter().map(|r| r.to_string()).collect();
                return Err(GardenError::Configuration(format!(
                    "dependency cycle detected: {}",
                    rendered.join(" -> ")
                )));
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm over the entry map; deterministic because the ready set
/// is ordered.
fn topo_sort(entries: &BTreeMap<ActionRef, Entry>) -> Vec<ActionRef> {
    let mut in_degree: BTreeMap<&ActionRef, usize> = entries
        .iter()
        .map(|(r, e)| (r, e.dependencies.len()))
        .collect();
    let mut dependants: BTreeMap<&ActionRef, Vec<&ActionRef>> = BTreeMap::new();
    for (reference, entry) in entries {
        for dep in &entry.dependencies {
            dependants.entry(dep).or_default().push(reference);
        }
    }

    let mut ready: VecDeque<&ActionRef> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(r, _)| *r)
        .collect();
    let mut order = Vec::with_capacity(entries.len());
    while let Some(next) = ready.pop_front() {
        order.push(next.clone());
        for &dependant in dependants.get(next).into_iter().flatten() {
            let degree = in_degree
                .get_mut(dependant)
                .expect("dependant tracked in in-degree map");
            *degree -= 1;
            if *degree == 0 {
                ready.push_back(dependant);
            }
        }
    }
    order
}
