//! # Garden Runtime
//!
//! The per-command session object, the watch/reconcile loop and the dev-mode
//! sync manager.
//!
//! A [`Garden`] session is constructed at command start and destroyed at
//! exit: it owns the loaded project, the plugin registry, the config graph,
//! the event bus and the result cache. Nothing here is process-global, so
//! tests construct several independent sessions.

mod sync;
mod watch;

pub use sync::DevSyncManager;
pub use watch::{ChangeHandler, WatchConfig, WatchExit, WatchLoop};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use garden_config::{load_project, ProjectConfig};
use garden_core::prelude::*;

/// Options fixed at session start.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Environment name; falls back to the project default.
    pub environment: Option<String>,
    /// Solver tuning; defaults match the machine.
    pub solver: Option<SolverConfig>,
    /// Provider configuration passed through to handlers opaquely.
    pub provider_config: Value,
    /// Secret values exposed to templates as `secrets.*`; supplied by the
    /// cloud/secrets client, which is an external collaborator.
    pub secrets: Value,
}

/// A Garden session: one command invocation's worth of state.
pub struct Garden {
    root: PathBuf,
    options: SessionOptions,
    project: ProjectConfig,
    environment: String,
    graph: Arc<ConfigGraph>,
    registry: Arc<PluginRegistry>,
    cache: Arc<ResultCache>,
    events: Arc<GardenEventBus>,
    handler_ctx: Arc<HandlerContext>,
    solver_config: SolverConfig,
    session_id: String,
}

impl Garden {
    /// Load the project under `root` and build the initial graph.
    pub fn open(
        root: &Path,
        registry: PluginRegistry,
        options: SessionOptions,
    ) -> Result<Self, GardenError> {
        registry.validate()?;
        let scan = load_project(root)?;
        let builder = GraphBuilder::for_project(&scan.project, options.environment.as_deref())?
            .with_secrets(options.secrets.clone());
        let graph = Arc::new(builder.build(scan.actions)?);

        let environment = options
            .environment
            .clone()
            .or_else(|| scan.project.default_environment.clone())
            .unwrap_or_else(|| "default".to_string());

        let events = Arc::new(GardenEventBus::default());
        let handler_ctx = Arc::new(HandlerContext {
            project_name: scan.project.name.clone(),
            environment: environment.clone(),
            provider_config: options.provider_config.clone(),
            events: events.clone(),
        });
        let solver_config = options.solver.clone().unwrap_or_default();
        let session_id = uuid::Uuid::new_v4().to_string();

        // Advisory state tree for plugin tools and caches.
        if let Err(e) = std::fs::create_dir_all(scan.project.state_dir()) {
            tracing::warn!(error = %e, "could not create project state directory");
        }

        tracing::info!(
            session_id = %session_id,
            project = %scan.project.name,
            environment = %environment,
            actions = graph.len(),
            "garden session opened"
        );

        Ok(Self {
            root: root.to_path_buf(),
            options,
            project: scan.project,
            environment,
            graph,
            registry: Arc::new(registry),
            cache: Arc::new(ResultCache::new()),
            events,
            handler_ctx,
            solver_config,
            session_id,
        })
    }

    pub fn project(&self) -> &ProjectConfig {
        &self.project
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn graph(&self) -> Arc<ConfigGraph> {
        self.graph.clone()
    }

    pub fn registry(&self) -> Arc<PluginRegistry> {
        self.registry.clone()
    }

    pub fn events(&self) -> Arc<GardenEventBus> {
        self.events.clone()
    }

    pub fn cache(&self) -> Arc<ResultCache> {
        self.cache.clone()
    }

    pub fn handler_context(&self) -> Arc<HandlerContext> {
        self.handler_ctx.clone()
    }

    /// A fresh planner over the current graph.
    pub fn planner(&self) -> TaskPlanner {
        TaskPlanner::new(self.graph.clone())
    }

    /// Validate that every enabled action has a provider for its type.
    pub fn check_action_types(&self) -> Result<(), GardenError> {
        for action in self.graph.get_actions(None, None) {
            if !self.registry.has_action_type(action.kind(), &action.type_name) {
                return Err(GardenError::Configuration(format!(
                    "action {} has type '{}' but no registered plugin implements it",
                    action.reference, action.type_name
                )));
            }
        }
        Ok(())
    }

    /// Run one solver pass over the given tasks.
    pub async fn process_tasks(
        &self,
        planner: TaskPlanner,
        tasks: Vec<Task>,
        cancel: CancellationToken,
    ) -> Result<GraphResults, GardenError> {
        let processor = Arc::new(GardenProcessor::new(
            planner,
            self.registry.clone(),
            self.cache.clone(),
            self.handler_ctx.clone(),
        ));
        let solver = TaskGraph::new(processor, self.events.clone())
            .with_config(self.solver_config.clone())
            .with_cancellation_token(cancel);
        solver.process(tasks).await
    }

    /// Re-parse the project and rebuild the graph in place.
    ///
    /// On failure the prior graph is kept and the error is returned, so the
    /// watch loop can keep serving the last good configuration.
    pub fn reload(&mut self) -> Result<(), GardenError> {
        let scan = load_project(&self.root)?;
        let builder =
            GraphBuilder::for_project(&scan.project, self.options.environment.as_deref())?
                .with_secrets(self.options.secrets.clone());
        let graph = builder.build(scan.actions)?;
        self.project = scan.project;
        self.graph = Arc::new(graph);
        tracing::info!(
            session_id = %self.session_id,
            actions = self.graph.len(),
            "project configuration reloaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! End-to-end scenarios over a full session with a recording plugin.

    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    /// Records handler invocations and simulates a remote: deployed services
    /// report ready on the next status check.
    #[derive(Default)]
    struct Recorder {
        order: Mutex<Vec<String>>,
        deployed: Mutex<BTreeSet<String>>,
        fail_builds: BTreeSet<String>,
    }

    impl Recorder {
        fn record(&self, entry: impl Into<String>) {
            self.order.lock().expect("order").push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.order.lock().expect("order").clone()
        }

        fn count_of(&self, entry: &str) -> usize {
            self.entries().iter().filter(|e| *e == entry).count()
        }
    }

    struct ScenarioHandlers(Arc<Recorder>);

    #[async_trait]
    impl BuildHandler for ScenarioHandlers {
        async fn build(&self, params: HandlerParams) -> Result<HandlerResult, GardenError> {
            let name = params.action.reference().name.clone();
            self.0.record(format!("build:{}", name));
            if self.0.fail_builds.contains(&name) {
                return Err(GardenError::Plugin(format!("build of '{}' broke", name)));
            }
            Ok(HandlerResult::ready(
                json!({"deployment-image-id": format!("registry/{}:{}", name, params.action.version())}),
            ))
        }
    }

    #[async_trait]
    impl DeployHandler for ScenarioHandlers {
        async fn deploy(&self, params: HandlerParams) -> Result<HandlerResult, GardenError> {
            let name = params.action.reference().name.clone();
            self.0.record(format!("deploy:{}", name));
            self.0.deployed.lock().expect("deployed").insert(name);
            Ok(HandlerResult::ready(json!({"devMode": false})))
        }

        async fn get_status(&self, params: HandlerParams) -> Result<HandlerResult, GardenError> {
            let name = &params.action.reference().name;
            if self.0.deployed.lock().expect("deployed").contains(name) {
                Ok(HandlerResult::ready(json!({"devMode": false})))
            } else {
                Ok(HandlerResult::missing())
            }
        }

        async fn delete(&self, params: HandlerParams) -> Result<HandlerResult, GardenError> {
            let name = params.action.reference().name.clone();
            self.0.record(format!("delete:{}", name));
            self.0.deployed.lock().expect("deployed").remove(&name);
            Ok(HandlerResult::new(ResultStatus::Stopped))
        }
    }

    #[async_trait]
    impl RunHandler for ScenarioHandlers {
        async fn run(&self, params: HandlerParams) -> Result<HandlerResult, GardenError> {
            self.0
                .record(format!("run:{}", params.action.reference().name));
            Ok(HandlerResult::ready(json!({"success": true})))
        }
    }

    #[async_trait]
    impl TestHandler for ScenarioHandlers {
        async fn run(&self, params: HandlerParams) -> Result<HandlerResult, GardenError> {
            self.0
                .record(format!("test:{}", params.action.reference().name));
            Ok(HandlerResult::ready(json!({"success": true})))
        }
    }

    fn registry(recorder: Arc<Recorder>) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry
            .register(
                PluginDefinition::new("scenario")
                    .with_action_type(ActionTypeDefinition::new(
                        "test",
                        ActionHandlers::Build(Arc::new(ScenarioHandlers(recorder.clone()))),
                    ))
                    .with_action_type(ActionTypeDefinition::new(
                        "test",
                        ActionHandlers::Deploy(Arc::new(ScenarioHandlers(recorder.clone()))),
                    ))
                    .with_action_type(ActionTypeDefinition::new(
                        "test",
                        ActionHandlers::Run(Arc::new(ScenarioHandlers(recorder.clone()))),
                    ))
                    .with_action_type(ActionTypeDefinition::new(
                        "test",
                        ActionHandlers::Test(Arc::new(ScenarioHandlers(recorder))),
                    )),
            )
            .unwrap();
        registry
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn session(dir: &Path, recorder: Arc<Recorder>) -> Garden {
        Garden::open(dir, registry(recorder), SessionOptions::default()).unwrap()
    }

    async fn run_kind(
        garden: &Garden,
        kind: TaskKind,
        reference: &ActionRef,
    ) -> GraphResults {
        let planner = garden.planner();
        let task = planner.task_for(kind, reference).unwrap();
        garden
            .process_tasks(planner, vec![task], CancellationToken::new())
            .await
            .unwrap()
    }

    #[test]
    fn test_build_then_deploy_and_short_circuit_on_rerun() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "garden.yml", "kind: Project\nname: demo\n");
            write(
                dir.path(),
                "app/app.garden.yml",
                "\
kind: Build
type: test
name: b
---
kind: Deploy
type: test
name: d
build: b
spec:
  image: ${actions.build.b.outputs.deployment-image-id}
",
            );

            let recorder = Arc::new(Recorder::default());
            let garden = session(dir.path(), recorder.clone());
            let results = run_kind(&garden, TaskKind::Deploy, &ActionRef::deploy("d")).await;

            // BuildStatus(b), Build(b), DeployStatus(d), Deploy(d).
            assert_eq!(results.len(), 4);
            assert_eq!(results.summary().succeeded, 4);
            assert_eq!(recorder.count_of("build:b"), 1);
            assert_eq!(recorder.count_of("deploy:d"), 1);

            // Re-run without changes: only the status tasks execute.
            let results = run_kind(&garden, TaskKind::Deploy, &ActionRef::deploy("d")).await;
            assert_eq!(results.summary().succeeded, 4);
            assert_eq!(recorder.count_of("build:b"), 1);
            assert_eq!(recorder.count_of("deploy:d"), 1);
            // BuildStatus served from cache, Build and Deploy short-circuited.
            let cached = results.completed().filter(|r| r.cached).count();
            assert_eq!(cached, 3);
        });
    }

    #[test]
    fn test_test_with_dependencies_runs_in_order() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "garden.yml", "kind: Project\nname: demo\n");
            write(
                dir.path(),
                "app/app.garden.yml",
                "\
kind: Build
type: test
name: b
---
kind: Deploy
type: test
name: d
build: b
---
kind: Test
type: test
name: t
build: b
dependencies: [deploy.d]
",
            );

            let recorder = Arc::new(Recorder::default());
            let garden = session(dir.path(), recorder.clone());
            let results = run_kind(&garden, TaskKind::Test, &ActionRef::test("t")).await;
            assert_eq!(results.failed().count(), 0);

            let order = recorder.entries();
            let pos = |e: &str| order.iter().position(|o| o == e).unwrap();
            assert!(pos("build:b") < pos("deploy:d"));
            assert!(pos("deploy:d") < pos("test:t"));
        });
    }

    #[test]
    fn test_failure_isolation_between_independent_builds() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "garden.yml", "kind: Project\nname: demo\n");
            write(
                dir.path(),
                "app/app.garden.yml",
                "\
kind: Build
type: test
name: b1
---
kind: Build
type: test
name: b2
",
            );

            let recorder = Arc::new(Recorder {
                fail_builds: BTreeSet::from(["b1".to_string()]),
                ..Default::default()
            });
            let garden = session(dir.path(), recorder.clone());

            let planner = garden.planner();
            let tasks = vec![
                planner
                    .task_for(TaskKind::Build, &ActionRef::build("b1"))
                    .unwrap(),
                planner
                    .task_for(TaskKind::Build, &ActionRef::build("b2"))
                    .unwrap(),
            ];
            let results = garden
                .process_tasks(planner, tasks, CancellationToken::new())
                .await
                .unwrap();

            let summary = results.summary();
            assert_eq!(summary.failed, 1);
            assert_eq!(recorder.count_of("build:b2"), 1);
            let failed: Vec<_> = results.failed().collect();
            assert_eq!(failed[0].action, ActionRef::build("b1"));
        });
    }

    #[test]
    fn test_dependants_first_delete_order() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "garden.yml", "kind: Project\nname: demo\n");
            write(
                dir.path(),
                "app/app.garden.yml",
                "\
kind: Deploy
type: test
name: a
---
kind: Deploy
type: test
name: b
dependencies: [deploy.a]
",
            );

            let recorder = Arc::new(Recorder::default());
            let garden = session(dir.path(), recorder.clone());

            let planner = garden.planner();
            let task = planner
                .task_for(TaskKind::DeleteDeploy, &ActionRef::deploy("a"))
                .unwrap()
                .with_dependants_first(true);
            let results = garden
                .process_tasks(planner, vec![task], CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(results.failed().count(), 0);

            let order = recorder.entries();
            let pos = |e: &str| order.iter().position(|o| o == e).unwrap();
            assert!(pos("delete:b") < pos("delete:a"));
        });
    }

    #[test]
    fn test_sessions_are_independent() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "garden.yml", "kind: Project\nname: demo\n");
            write(
                dir.path(),
                "app/app.garden.yml",
                "kind: Build\ntype: test\nname: b\n",
            );

            let recorder = Arc::new(Recorder::default());
            let first = session(dir.path(), recorder.clone());
            run_kind(&first, TaskKind::Build, &ActionRef::build("b")).await;
            assert_eq!(recorder.count_of("build:b"), 1);

            // A fresh session has its own result cache: the build runs again.
            let second = session(dir.path(), recorder.clone());
            run_kind(&second, TaskKind::Build, &ActionRef::build("b")).await;
            assert_eq!(recorder.count_of("build:b"), 2);
            assert_ne!(first.session_id(), second.session_id());
        });
    }
}
