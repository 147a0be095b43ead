//! Watch & reconcile loop.
//!
//! Entered after the initial task set completes when the command is
//! persistent (`dev`) or `--watch` is set. Filesystem events are coalesced in
//! a debounce window, mapped to affected actions, and handed to the command's
//! change handler to obtain the next task set. Config-file changes re-parse
//! the project: a parse failure keeps the prior graph, a success drains the
//! loop and signals that a restart is required.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use garden_config::{is_config_file_name, ActionRef, STATE_DIR};
use garden_core::prelude::*;

use crate::Garden;

/// Maps a changed action to the tasks that should run for it.
pub type ChangeHandler =
    Arc<dyn Fn(&ConfigGraph, &ActionRef) -> Result<Vec<Task>, GardenError> + Send + Sync>;

/// Watch loop tuning.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Window in which filesystem events are coalesced before the change
    /// handler runs.
    pub debounce: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
        }
    }
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchExit {
    /// The project config changed and parsed cleanly; the caller should
    /// rebuild and re-enter the loop.
    pub restart_required: bool,
}

/// The reconcile loop over one Garden session.
pub struct WatchLoop {
    handler: ChangeHandler,
    config: WatchConfig,
    cancel: CancellationToken,
    fs_tx: mpsc::UnboundedSender<PathBuf>,
    fs_rx: mpsc::UnboundedReceiver<PathBuf>,
    _watcher: Option<RecommendedWatcher>,
}

impl WatchLoop {
    pub fn new(handler: ChangeHandler) -> Self {
        let (fs_tx, fs_rx) = mpsc::unbounded_channel();
        Self {
            handler,
            config: WatchConfig::default(),
            cancel: CancellationToken::new(),
            fs_tx,
            fs_rx,
            _watcher: None,
        }
    }

    pub fn with_config(mut self, config: WatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sender feeding changed paths into the loop. The filesystem watcher
    /// uses this internally; tests and custom integrations may inject paths
    /// directly.
    pub fn path_sender(&self) -> mpsc::UnboundedSender<PathBuf> {
        self.fs_tx.clone()
    }

    /// Attach a recursive filesystem watcher on the project root.
    pub fn watch_filesystem(&mut self, root: &Path) -> Result<(), GardenError> {
        let tx = self.fs_tx.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
            },
        )
        .map_err(|e| GardenError::Runtime(format!("failed to create file watcher: {}", e)))?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| GardenError::Runtime(format!("failed to watch {}: {}", root.display(), e)))?;
        self._watcher = Some(watcher);
        Ok(())
    }

    /// Run the loop until cancellation, an exit/restart request or a clean
    /// config reload.
    pub async fn run(mut self, garden: &mut Garden) -> Result<WatchExit, GardenError> {
        use tokio::sync::broadcast::error::RecvError;

        enum Wake {
            Cancelled,
            Bus(Result<GardenEvent, RecvError>),
            Fs(Option<PathBuf>),
        }

        let mut bus_rx = garden.events().subscribe();
        let cancel = self.cancel.clone();
        tracing::info!("Waiting for code changes...");

        loop {
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                event = bus_rx.recv() => Wake::Bus(event),
                path = self.fs_rx.recv() => Wake::Fs(path),
            };

            match wake {
                Wake::Cancelled => {
                    return Ok(WatchExit {
                        restart_required: false,
                    });
                }
                Wake::Bus(event) => match event {
                    Ok(GardenEvent::Exit) => {
                        return Ok(WatchExit {
                            restart_required: false,
                        });
                    }
                    Ok(GardenEvent::Restart) => {
                        return Ok(WatchExit {
                            restart_required: true,
                        });
                    }
                    Ok(GardenEvent::ConfigAdded { .. })
                    | Ok(GardenEvent::ConfigChanged { .. })
                    | Ok(GardenEvent::ConfigRemoved { .. }) => {
                        if self.reload(garden) {
                            return Ok(WatchExit {
                                restart_required: true,
                            });
                        }
                    }
                    Ok(GardenEvent::SourcesChanged { refs }) => {
                        self.reconcile(garden, refs).await;
                    }
                    Ok(GardenEvent::BuildRequested { name }) => {
                        self.requested(garden, TaskKind::Build, &name).await;
                    }
                    Ok(GardenEvent::DeployRequested { name }) => {
                        self.requested(garden, TaskKind::Deploy, &name).await;
                    }
                    Ok(GardenEvent::TestRequested { name }) => {
                        self.requested(garden, TaskKind::Test, &name).await;
                    }
                    Ok(GardenEvent::TaskRequested { name }) => {
                        self.requested(garden, TaskKind::Run, &name).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event bus receiver lagged");
                    }
                    Err(RecvError::Closed) => {
                        return Ok(WatchExit {
                            restart_required: false,
                        });
                    }
                },
                Wake::Fs(path) => {
                    let Some(path) = path else {
                        return Ok(WatchExit {
                            restart_required: false,
                        });
                    };
                    let batch = self.collect_batch(path).await;
                    if batch.iter().any(|p| is_config_path(p)) {
                        if self.reload(garden) {
                            return Ok(WatchExit {
                                restart_required: true,
                            });
                        }
                        continue;
                    }
                    let refs = affected_actions(&garden.graph(), garden.project(), &batch);
                    if !refs.is_empty() {
                        self.reconcile(garden, refs).await;
                    }
                }
            }
        }
    }

    /// Coalesce further events arriving within the debounce window.
    async fn collect_batch(&mut self, first: PathBuf) -> Vec<PathBuf> {
        let mut batch = vec![first];
        let deadline = Instant::now() + self.config.debounce;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.fs_rx.recv()).await {
                Ok(Some(path)) => batch.push(path),
                Ok(None) | Err(_) => break,
            }
        }
        batch
    }

    /// Re-parse the project; returns true when the loop should restart.
    fn reload(&self, garden: &mut Garden) -> bool {
        match garden.reload() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "config reload failed; keeping previous graph");
                false
            }
        }
    }

    /// Run the change handler for each affected action and solve the union.
    async fn reconcile(&self, garden: &Garden, refs: Vec<ActionRef>) {
        let graph = garden.graph();
        let mut tasks: Vec<Task> = Vec::new();
        for reference in &refs {
            match (self.handler)(&graph, reference) {
                Ok(more) => tasks.extend(more),
                Err(e) => {
                    tracing::error!(action = %reference, error = %e, "change handler failed");
                }
            }
        }
        if tasks.is_empty() {
            return;
        }
        tracing::info!(
            changed = refs.len(),
            tasks = tasks.len(),
            "sources changed; scheduling reconcile pass"
        );
        self.solve(garden, tasks).await;
    }

    /// Handle an explicit task request from the event bus.
    async fn requested(&self, garden: &Garden, kind: TaskKind, name: &str) {
        let reference = ActionRef::new(kind.action_kind(), name.to_string());
        let planner = garden.planner();
        match planner.task_for(kind, &reference) {
            Ok(task) => self.solve(garden, vec![task]).await,
            Err(e) => {
                tracing::warn!(action = %reference, error = %e, "requested task could not be planned");
            }
        }
    }

    /// One solver pass; watch-mode failures never terminate the process.
    async fn solve(&self, garden: &Garden, tasks: Vec<Task>) {
        let pass_cancel = self.cancel.child_token();
        match garden.process_tasks(garden.planner(), tasks, pass_cancel).await {
            Ok(results) => {
                let summary = results.summary();
                if summary.failed > 0 {
                    tracing::warn!(failed = summary.failed, "reconcile pass had failures");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "reconcile pass aborted");
            }
        }
        tracing::info!("Waiting for code changes...");
    }
}

/// Whether a changed path is a Garden config file.
fn is_config_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(is_config_file_name)
        .unwrap_or(false)
}

/// Map changed paths to the enabled actions whose source roots contain them,
/// honouring project-wide and per-action excludes plus the implicit `.git`
/// and state-directory excludes.
fn affected_actions(
    graph: &ConfigGraph,
    project: &garden_config::ProjectConfig,
    paths: &[PathBuf],
) -> Vec<ActionRef> {
    let mut out = Vec::new();
    for action in graph.get_actions(None, None) {
        let hit = paths.iter().any(|path| {
            path.starts_with(&action.source_path)
                && !is_excluded(path, &project.exclude, &action.exclude)
        });
        if hit {
            out.push(action.reference.clone());
        }
    }
    out.sort();
    out
}

fn is_excluded(path: &Path, project_excludes: &[String], action_excludes: &[String]) -> bool {
    for component in path.components() {
        if let Component::Normal(name) = component {
            let name = name.to_string_lossy();
            if name == ".git" || name == STATE_DIR {
                return true;
            }
            if project_excludes.iter().chain(action_excludes).any(|e| {
                // Excludes match path components, with or without a "./".
                e.trim_start_matches("./") == name
            }) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionOptions;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StaticBuild;

    #[async_trait]
    impl BuildHandler for StaticBuild {
        async fn build(&self, _params: HandlerParams) -> Result<HandlerResult, GardenError> {
            Ok(HandlerResult::ready(Value::Null))
        }
    }

    struct CountingDeploy(Arc<AtomicUsize>);

    #[async_trait]
    impl DeployHandler for CountingDeploy {
        async fn deploy(&self, _params: HandlerParams) -> Result<HandlerResult, GardenError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerResult::ready(Value::Null))
        }

        async fn delete(&self, _params: HandlerParams) -> Result<HandlerResult, GardenError> {
            Ok(HandlerResult::new(ResultStatus::Stopped))
        }
    }

    fn registry(deploys: Arc<AtomicUsize>) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry
            .register(
                PluginDefinition::new("test")
                    .with_action_type(ActionTypeDefinition::new(
                        "test",
                        ActionHandlers::Build(Arc::new(StaticBuild)),
                    ))
                    .with_action_type(ActionTypeDefinition::new(
                        "test",
                        ActionHandlers::Deploy(Arc::new(CountingDeploy(deploys))),
                    )),
            )
            .unwrap();
        registry
    }

    const PROJECT: &str = "kind: Project\nname: demo\n";
    const ACTION_A: &str = "\
kind: Build
type: test
name: a
---
kind: Deploy
type: test
name: a
build: a
";
    const ACTION_B: &str = "kind: Deploy\ntype: test\nname: b\n";

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn change_handler(seen: Arc<Mutex<Vec<ActionRef>>>) -> ChangeHandler {
        Arc::new(move |graph: &ConfigGraph, changed: &ActionRef| {
            seen.lock().expect("seen").push(changed.clone());
            let config = graph.get(changed)?;
            let task = Task::new(
                match changed.kind {
                    ActionKind::Build => TaskKind::Build,
                    ActionKind::Deploy => TaskKind::Deploy,
                    ActionKind::Run => TaskKind::Run,
                    ActionKind::Test => TaskKind::Test,
                },
                changed.clone(),
                config.version.clone(),
            )
            .with_force(true);
            Ok(vec![task])
        })
    }

    #[test]
    fn test_source_change_reconciles_only_affected_actions() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "garden.yml", PROJECT);
            write(dir.path(), "a/a.garden.yml", ACTION_A);
            write(dir.path(), "b/b.garden.yml", ACTION_B);
            write(dir.path(), "a/src/main.rs", "fn main() {}");

            let deploys = Arc::new(AtomicUsize::new(0));
            let mut garden =
                Garden::open(dir.path(), registry(deploys.clone()), SessionOptions::default())
                    .unwrap();

            let seen = Arc::new(Mutex::new(Vec::new()));
            let watch = WatchLoop::new(change_handler(seen.clone())).with_config(WatchConfig {
                debounce: Duration::from_millis(30),
            });
            let cancel = watch.cancel.clone();
            let tx = watch.path_sender();

            // Two rapid events in the same window coalesce into one pass.
            tx.send(dir.path().join("a/src/main.rs")).unwrap();
            tx.send(dir.path().join("a/src/main.rs")).unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                cancel.cancel();
            });

            let exit = watch.run(&mut garden).await.unwrap();
            assert!(!exit.restart_required);

            let seen = seen.lock().expect("seen").clone();
            assert!(seen.contains(&ActionRef::deploy("a")));
            assert!(seen.contains(&ActionRef::build("a")));
            assert!(!seen.contains(&ActionRef::deploy("b")));
            // One coalesced pass; deploy.a ran exactly once.
            assert_eq!(deploys.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_config_change_requests_restart() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "garden.yml", PROJECT);
            write(dir.path(), "a/a.garden.yml", ACTION_A);

            let deploys = Arc::new(AtomicUsize::new(0));
            let mut garden =
                Garden::open(dir.path(), registry(deploys), SessionOptions::default()).unwrap();

            let watch = WatchLoop::new(change_handler(Arc::new(Mutex::new(Vec::new()))))
                .with_config(WatchConfig {
                    debounce: Duration::from_millis(10),
                });
            let tx = watch.path_sender();

            // Add a new action and touch the config file.
            write(dir.path(), "b/b.garden.yml", ACTION_B);
            tx.send(dir.path().join("b/b.garden.yml")).unwrap();

            let exit = watch.run(&mut garden).await.unwrap();
            assert!(exit.restart_required);
            assert!(garden.graph().contains(&ActionRef::deploy("b")));
        });
    }

    #[test]
    fn test_broken_config_keeps_prior_graph() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "garden.yml", PROJECT);
            write(dir.path(), "a/a.garden.yml", ACTION_A);

            let deploys = Arc::new(AtomicUsize::new(0));
            let mut garden =
                Garden::open(dir.path(), registry(deploys), SessionOptions::default()).unwrap();
            let actions_before = garden.graph().len();

            let watch = WatchLoop::new(change_handler(Arc::new(Mutex::new(Vec::new()))))
                .with_config(WatchConfig {
                    debounce: Duration::from_millis(10),
                });
            let cancel = watch.cancel.clone();
            let tx = watch.path_sender();

            write(dir.path(), "a/a.garden.yml", "kind: Build\nname: [broken\n");
            tx.send(dir.path().join("a/a.garden.yml")).unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                cancel.cancel();
            });

            let exit = watch.run(&mut garden).await.unwrap();
            assert!(!exit.restart_required);
            assert_eq!(garden.graph().len(), actions_before);
        });
    }

    #[test]
    fn test_exit_event_stops_loop() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "garden.yml", PROJECT);
            write(dir.path(), "a/a.garden.yml", ACTION_A);

            let deploys = Arc::new(AtomicUsize::new(0));
            let mut garden =
                Garden::open(dir.path(), registry(deploys), SessionOptions::default()).unwrap();
            let events = garden.events();

            let watch = WatchLoop::new(change_handler(Arc::new(Mutex::new(Vec::new()))));
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                events.publish(GardenEvent::Exit);
            });

            let exit = watch.run(&mut garden).await.unwrap();
            assert!(!exit.restart_required);
        });
    }

    #[test]
    fn test_excluded_paths_do_not_trigger() {
        let excludes = vec!["node_modules".to_string()];
        assert!(is_excluded(
            Path::new("/p/a/node_modules/x.js"),
            &excludes,
            &[]
        ));
        assert!(is_excluded(Path::new("/p/.git/HEAD"), &[], &[]));
        assert!(is_excluded(Path::new("/p/.garden/cache"), &[], &[]));
        assert!(!is_excluded(Path::new("/p/a/src/main.rs"), &excludes, &[]));
    }
}
