//! Task execution: dispatches each task kind to its resolved handler chain,
//! applying cache and status short-circuits.
//!
//! Handler failures of task-fatal kinds become failed results so the solver
//! can keep independent branches running; configuration and internal errors
//! propagate and abort the pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use garden_config::ActionRef;
use garden_template::{
    resolve_value, ConfigContext, LayeredContext, Lookup, MapContext, PathSegment, ResolveOptions,
    TemplateError,
};

use crate::actions::{ActionConfig, ResolvedAction};
use crate::cache::ResultCache;
use crate::error::GardenError;
use crate::events::GardenEvent;
use crate::graph::builder::parse_action_path;
use crate::graph::ConfigGraph;
use crate::plugin::{HandlerContext, HandlerParams, HandlerResult, PluginRegistry};
use crate::tasks::{
    dependency_result, DependencyResults, ResultStatus, Task, TaskKind, TaskPlanner, TaskResult,
    TaskResultBuilder,
};

/// A unit-of-work executor the solver drives. Implemented by the real engine
/// below and by static fixtures in solver tests.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Prerequisite tasks that must terminate before `task` starts.
    fn prerequisites(&self, task: &Task) -> Result<Vec<Task>, GardenError>;

    /// Execute the task, observing the results of its prerequisites.
    async fn process(
        &self,
        task: &Task,
        deps: &DependencyResults,
        cancel: CancellationToken,
    ) -> Result<TaskResult, GardenError>;
}

/// Context layer exposing dependency outputs at execution time:
/// `actions.<kind>.<name>.outputs.*` plus the static name/version fields.
pub struct ActionOutputsContext {
    graph: Arc<ConfigGraph>,
    outputs: BTreeMap<ActionRef, Value>,
}

impl ActionOutputsContext {
    pub fn new(graph: Arc<ConfigGraph>, deps: &DependencyResults) -> Self {
        let mut outputs = BTreeMap::new();
        for result in deps.values() {
            // Execution results supersede status results for the same action.
            let entry = outputs.entry(result.action.clone()).or_insert(Value::Null);
            if entry.is_null() || !result.kind.is_status() {
                *entry = result.output.clone();
            }
        }
        Self { graph, outputs }
    }

    /// Nested value tree for the handler-facing runtime payload.
    pub fn runtime_value(&self) -> Value {
        let mut actions = Map::new();
        for (reference, outputs) in &self.outputs {
            let kind_entry = actions
                .entry(reference.kind.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(by_name) = kind_entry {
                by_name.insert(
                    reference.name.clone(),
                    serde_json::json!({ "outputs": outputs }),
                );
            }
        }
        Value::Object(Map::from_iter([(
            "actions".to_string(),
            Value::Object(actions),
        )]))
    }
}

impl ConfigContext for ActionOutputsContext {
    fn lookup(&self, path: &[PathSegment]) -> Result<Lookup, TemplateError> {
        let Some(reference) = parse_action_path(path) else {
            return Ok(Lookup::missing());
        };
        let field = match path.get(3) {
            Some(PathSegment::Key(k)) => k.as_str(),
            _ => return Ok(Lookup::missing()),
        };
        match field {
            "name" => Ok(Lookup::Found(Value::String(reference.name.clone()))),
            "version" => match self.graph.get(&reference) {
                Ok(config) => Ok(Lookup::Found(Value::String(config.version.clone()))),
                Err(_) => Ok(Lookup::missing()),
            },
            "disabled" => match self.graph.get(&reference) {
                Ok(config) => Ok(Lookup::Found(Value::Bool(config.disabled))),
                Err(_) => Ok(Lookup::missing()),
            },
            "outputs" => {
                let Some(outputs) = self.outputs.get(&reference) else {
                    return Ok(Lookup::Missing {
                        partial: false,
                        message: Some(format!(
                            "outputs of {} are not available; is it declared as a dependency?",
                            reference
                        )),
                    });
                };
                let rest: Vec<PathSegment> = path[4..].to_vec();
                match garden_template::context::descend(outputs, &rest) {
                    Some(v) => Ok(Lookup::Found(v.clone())),
                    None => Ok(Lookup::missing()),
                }
            }
            _ => Ok(Lookup::missing()),
        }
    }
}

/// The real task engine: plans via [`TaskPlanner`], resolves actions against
/// the execution context, and routes handler calls through the registry.
pub struct GardenProcessor {
    planner: TaskPlanner,
    registry: Arc<PluginRegistry>,
    cache: Arc<ResultCache>,
    handler_ctx: Arc<HandlerContext>,
}

impl GardenProcessor {
    pub fn new(
        planner: TaskPlanner,
        registry: Arc<PluginRegistry>,
        cache: Arc<ResultCache>,
        handler_ctx: Arc<HandlerContext>,
    ) -> Self {
        Self {
            planner,
            registry,
            cache,
            handler_ctx,
        }
    }

    pub fn planner(&self) -> &TaskPlanner {
        &self.planner
    }

    fn graph(&self) -> &Arc<ConfigGraph> {
        self.planner.graph()
    }

    /// Resolve the action's spec against project variables plus the outputs
    /// of its terminated prerequisites.
    ///
    /// Status and delete tasks resolve partially: they run before dependency
    /// outputs exist, and their handlers only need the statically known
    /// parts of the spec.
    fn resolve_action(
        &self,
        config: &ActionConfig,
        deps: &DependencyResults,
        allow_partial: bool,
    ) -> Result<ResolvedAction, GardenError> {
        let mut scope = Map::new();
        scope.insert(
            "project".to_string(),
            serde_json::json!({ "name": self.handler_ctx.project_name }),
        );
        scope.insert(
            "environment".to_string(),
            serde_json::json!({ "name": self.handler_ctx.environment }),
        );
        scope.insert("var".to_string(), config.variables.clone());

        let ctx = LayeredContext::new()
            .with_layer(Arc::new(MapContext::new(Value::Object(scope))))
            .with_layer(Arc::new(ActionOutputsContext::new(
                self.graph().clone(),
                deps,
            )));

        let opts = if allow_partial {
            ResolveOptions::partial()
        } else {
            ResolveOptions::full()
        };
        let spec = resolve_value(&config.spec, &ctx, &opts).map_err(|e| {
            GardenError::Configuration(format!("resolving {}: {}", config.reference, e))
        })?;
        Ok(ResolvedAction {
            config: config.clone(),
            spec,
        })
    }

    fn params(
        &self,
        resolved: &ResolvedAction,
        deps: &DependencyResults,
        cancel: CancellationToken,
    ) -> HandlerParams {
        HandlerParams {
            ctx: self.handler_ctx.clone(),
            action: resolved.clone(),
            runtime: ActionOutputsContext::new(self.graph().clone(), deps).runtime_value(),
            cancel,
        }
    }

    /// Turn a handler outcome into a task result, keeping command-fatal
    /// errors fatal.
    fn finish(
        &self,
        builder: TaskResultBuilder,
        outcome: Result<HandlerResult, GardenError>,
    ) -> Result<TaskResult, GardenError> {
        match outcome {
            Ok(hr) if hr.state == ResultStatus::Error => {
                Ok(builder.failed(if hr.detail.is_empty() {
                    "handler reported an error".to_string()
                } else {
                    hr.detail
                }))
            }
            Ok(hr) => Ok(builder.finish(hr.state, hr.outputs, hr.detail)),
            Err(e) if e.is_command_fatal() => Err(e),
            Err(e) => Ok(builder.failed(e.to_string())),
        }
    }

    /// Under `--skip-dependencies`, executions require every substituted
    /// status check to have come back ready.
    fn check_skipped_dependencies(
        &self,
        task: &Task,
        deps: &DependencyResults,
    ) -> Option<String> {
        if !task.skip_dependencies
            || task.kind.is_status()
            || task.kind == TaskKind::DeleteDeploy
        {
            return None;
        }
        for result in deps.values() {
            if result.action == task.action {
                continue;
            }
            if matches!(result.kind, TaskKind::DeployStatus | TaskKind::RunStatus)
                && !result.status.is_ready()
            {
                return Some(format!(
                    "dependency-not-ready: {} is {} (run without --skip-dependencies to execute it)",
                    result.action, result.status
                ));
            }
        }
        None
    }

    fn store(&self, result: &TaskResult) -> Result<(), GardenError> {
        self.cache.put(result.clone())
    }
}

#[async_trait]
impl TaskProcessor for GardenProcessor {
    fn prerequisites(&self, task: &Task) -> Result<Vec<Task>, GardenError> {
        self.planner.prerequisites(task)
    }

    async fn process(
        &self,
        task: &Task,
        deps: &DependencyResults,
        cancel: CancellationToken,
    ) -> Result<TaskResult, GardenError> {
        let config = self.graph().get(&task.action)?.clone();
        let builder = TaskResult::started(task);
        let allow_partial = task.kind.is_status() || task.kind == TaskKind::DeleteDeploy;
        let resolved = self.resolve_action(&config, deps, allow_partial)?;

        if let Some(reason) = self.check_skipped_dependencies(task, deps) {
            return Ok(builder.failed(reason));
        }

        match task.kind {
            TaskKind::BuildStatus => {
                if let Some(hit) = self.cache.get(&task.action, &task.version)? {
                    return Ok(builder.cached(ResultStatus::Ready, hit.output));
                }
                let handlers = self.registry.resolve_build(&config.type_name)?;
                let outcome = handlers
                    .current()
                    .get_status(self.params(&resolved, deps, cancel))
                    .await;
                self.finish(builder, outcome)
            }
            TaskKind::Build => {
                if !task.force {
                    if let Some(status) =
                        dependency_result(deps, TaskKind::BuildStatus, &task.action)
                    {
                        if status.status.is_ready() {
                            tracing::debug!(action = %task.action, "build is up to date");
                            return Ok(builder.cached(ResultStatus::Ready, status.output.clone()));
                        }
                    }
                }
                let handlers = self.registry.resolve_build(&config.type_name)?;
                let outcome = handlers
                    .current()
                    .build(self.params(&resolved, deps, cancel))
                    .await;
                let result = self.finish(builder, outcome)?;
                self.store(&result)?;
                Ok(result)
            }
            TaskKind::DeployStatus => {
                let handlers = self.registry.resolve_deploy(&config.type_name)?;
                let outcome = handlers
                    .current()
                    .get_status(self.params(&resolved, deps, cancel))
                    .await;
                let result = self.finish(builder, outcome)?;
                self.handler_ctx.events.publish(GardenEvent::DeployStatusUpdate {
                    action: task.action.clone(),
                    state: result.status,
                });
                Ok(result)
            }
            TaskKind::Deploy => {
                if !task.force {
                    if let Some(status) =
                        dependency_result(deps, TaskKind::DeployStatus, &task.action)
                    {
                        let reported_dev_mode = status
                            .output
                            .get("devMode")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        if status.status.is_ready() && reported_dev_mode == task.dev_mode {
                            tracing::debug!(action = %task.action, "deploy is up to date");
                            return Ok(builder.cached(ResultStatus::Ready, status.output.clone()));
                        }
                    }
                }
                let handlers = self.registry.resolve_deploy(&config.type_name)?;
                let outcome = handlers
                    .current()
                    .deploy(self.params(&resolved, deps, cancel))
                    .await;
                let result = self.finish(builder, outcome)?;
                self.store(&result)?;
                self.handler_ctx.events.publish(GardenEvent::DeployStatusUpdate {
                    action: task.action.clone(),
                    state: result.status,
                });
                Ok(result)
            }
            TaskKind::DeleteDeploy => {
                let handlers = self.registry.resolve_deploy(&config.type_name)?;
                let outcome = handlers
                    .current()
                    .delete(self.params(&resolved, deps, cancel))
                    .await;
                let result = self.finish(builder, outcome)?;
                self.handler_ctx.events.publish(GardenEvent::DeployStatusUpdate {
                    action: task.action.clone(),
                    state: result.status,
                });
                Ok(result)
            }
            TaskKind::RunStatus => {
                if let Some(hit) = self.cache.get(&task.action, &task.version)? {
                    return Ok(builder.cached(ResultStatus::Ready, hit.output));
                }
                let handlers = self.registry.resolve_run(&config.type_name)?;
                let outcome = handlers
                    .current()
                    .get_result(self.params(&resolved, deps, cancel))
                    .await;
                match outcome {
                    Ok(Some(hr)) => self.finish(builder, Ok(hr)),
                    Ok(None) => Ok(builder.finish(
                        ResultStatus::Missing,
                        Value::Null,
                        String::new(),
                    )),
                    Err(e) => self.finish(builder, Err(e)),
                }
            }
            TaskKind::Run => {
                if !task.force {
                    if let Some(status) = dependency_result(deps, TaskKind::RunStatus, &task.action)
                    {
                        if status.status.is_ready() {
                            return Ok(builder.cached(ResultStatus::Ready, status.output.clone()));
                        }
                    }
                }
                let handlers = self.registry.resolve_run(&config.type_name)?;
                let outcome = handlers
                    .current()
                    .run(self.params(&resolved, deps, cancel))
                    .await;
                let result = self.finish(builder, outcome)?;
                self.store(&result)?;
                Ok(result)
            }
            TaskKind::TestStatus => {
                if let Some(hit) = self.cache.get(&task.action, &task.version)? {
                    if hit.success() {
                        return Ok(builder.cached(ResultStatus::Ready, hit.output));
                    }
                }
                let handlers = self.registry.resolve_test(&config.type_name)?;
                let outcome = handlers
                    .current()
                    .get_result(self.params(&resolved, deps, cancel))
                    .await;
                match outcome {
                    Ok(Some(hr)) => self.finish(builder, Ok(hr)),
                    Ok(None) => Ok(builder.finish(
                        ResultStatus::Missing,
                        Value::Null,
                        String::new(),
                    )),
                    Err(e) => self.finish(builder, Err(e)),
                }
            }
            TaskKind::Test => {
                if !task.force {
                    if let Some(status) =
                        dependency_result(deps, TaskKind::TestStatus, &task.action)
                    {
                        if status.status.is_ready() {
                            tracing::debug!(action = %task.action, "test already passed for this version");
                            return Ok(builder.cached(ResultStatus::Ready, status.output.clone()));
                        }
                    }
                }
                let handlers = self.registry.resolve_test(&config.type_name)?;
                let outcome = handlers
                    .current()
                    .run(self.params(&resolved, deps, cancel))
                    .await;
                let result = self.finish(builder, outcome)?;
                self.store(&result)?;
                Ok(result)
            }
        }
    }
}
