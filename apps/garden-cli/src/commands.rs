//! Command implementations: initial task sets, watch-mode entry and result
//! reporting.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use garden_config::find_project_root;
use garden_core::prelude::*;
use garden_exec::exec_plugin;
use garden_runtime::{ChangeHandler, DevSyncManager, Garden, SessionOptions, WatchExit, WatchLoop};

use crate::cli::{Cli, Command, DeleteTarget, DeployArgs, RunTarget, TestArgs};

/// Execute the parsed command; returns the process exit code.
pub async fn execute(cli: Cli) -> Result<i32, GardenError> {
    let root = resolve_root(cli.global.root.clone())?;

    let mut registry = PluginRegistry::new();
    registry.register(exec_plugin())?;

    let options = SessionOptions {
        environment: cli.global.env.clone(),
        ..Default::default()
    };
    let mut garden = Garden::open(&root, registry, options)?;
    garden.check_action_types()?;

    let cancel = CancellationToken::new();
    spawn_interrupt_listener(cancel.clone());

    let code = match cli.command {
        Command::Deploy(args) => deploy(&mut garden, &cli.global, args, cancel.clone()).await?,
        Command::Test(args) => test(&mut garden, &cli.global, args, cancel.clone()).await?,
        Command::Run { target } => run_single(&garden, target, cancel.clone()).await?,
        Command::Delete { target } => delete(&garden, &cli.global, target, cancel.clone()).await?,
        Command::Dev => dev(&mut garden, cancel.clone()).await?,
    };

    if cancel.is_cancelled() {
        return Ok(130);
    }
    Ok(code)
}

fn resolve_root(explicit: Option<PathBuf>) -> Result<PathBuf, GardenError> {
    if let Some(root) = explicit {
        return Ok(root);
    }
    let start = std::env::var_os(garden_config::ENV_WORKING_DIR)
        .map(PathBuf::from)
        .map(Ok)
        .unwrap_or_else(std::env::current_dir)
        .map_err(|e| GardenError::Parameter(format!("cannot determine working directory: {}", e)))?;
    Ok(find_project_root(&start)?)
}

fn spawn_interrupt_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling");
            cancel.cancel();
        }
    });
}

/// Named refs of a kind, or every enabled action of that kind.
fn select_refs(
    graph: &ConfigGraph,
    kind: ActionKind,
    names: &[String],
) -> Result<Vec<ActionRef>, GardenError> {
    if names.is_empty() {
        return Ok(graph
            .get_actions(None, Some(kind))
            .into_iter()
            .map(|a| a.reference.clone())
            .collect());
    }
    let mut refs = Vec::new();
    for name in names {
        let reference = ActionRef::new(kind, name.clone());
        // Unknown names are parameter errors, not configuration errors.
        if !graph.contains(&reference) {
            return Err(GardenError::Parameter(format!(
                "{} '{}' is not declared in this project",
                kind, name
            )));
        }
        refs.push(reference);
    }
    Ok(refs)
}

async fn deploy(
    garden: &mut Garden,
    global: &crate::cli::GlobalOpts,
    args: DeployArgs,
    cancel: CancellationToken,
) -> Result<i32, GardenError> {
    let refs = select_refs(&garden.graph(), ActionKind::Deploy, &args.names)?;
    let planner = garden
        .planner()
        .with_skip_dependencies(args.skip_dependencies)
        .with_force_actions(if global.force { refs.clone() } else { vec![] });

    let mut tasks = Vec::new();
    for reference in &refs {
        tasks.push(planner.task_for(TaskKind::Deploy, reference)?);
    }
    let results = garden
        .process_tasks(planner, tasks, cancel.child_token())
        .await?;
    let code = report(&results);

    if args.watch && !cancel.is_cancelled() {
        run_watch_loop(garden, deploy_change_handler(), cancel).await?;
    }
    Ok(code)
}

async fn test(
    garden: &mut Garden,
    global: &crate::cli::GlobalOpts,
    args: TestArgs,
    cancel: CancellationToken,
) -> Result<i32, GardenError> {
    let refs = select_refs(&garden.graph(), ActionKind::Test, &args.names)?;
    let planner = garden
        .planner()
        .with_skip_dependencies(args.skip_dependencies)
        .with_force_actions(if global.force { refs.clone() } else { vec![] });

    let mut tasks = Vec::new();
    for reference in &refs {
        tasks.push(planner.task_for(TaskKind::Test, reference)?);
    }
    let results = garden
        .process_tasks(planner, tasks, cancel.child_token())
        .await?;
    let code = report(&results);

    if args.watch && !cancel.is_cancelled() {
        run_watch_loop(garden, test_change_handler(), cancel).await?;
    }
    Ok(code)
}

async fn run_single(
    garden: &Garden,
    target: RunTarget,
    cancel: CancellationToken,
) -> Result<i32, GardenError> {
    let (kind, name) = match target {
        RunTarget::Build { name } => (TaskKind::Build, name),
        RunTarget::Deploy { name } => (TaskKind::Deploy, name),
        RunTarget::Task { name } => (TaskKind::Run, name),
        RunTarget::Test { name } => (TaskKind::Test, name),
    };
    let reference = ActionRef::new(kind.action_kind(), name.clone());
    if !garden.graph().contains(&reference) {
        return Err(GardenError::Parameter(format!(
            "{} '{}' is not declared in this project",
            kind.action_kind(),
            name
        )));
    }

    // `run` means execute now: short-circuits are bypassed for the target.
    let planner = garden.planner().with_force_actions([reference.clone()]);
    let task = planner.task_for(kind, &reference)?;
    let results = garden
        .process_tasks(planner, vec![task], cancel.child_token())
        .await?;
    Ok(report(&results))
}

async fn delete(
    garden: &Garden,
    global: &crate::cli::GlobalOpts,
    target: DeleteTarget,
    cancel: CancellationToken,
) -> Result<i32, GardenError> {
    let graph = garden.graph();
    let (mut refs, dependants_first) = match target {
        DeleteTarget::Deploy {
            names,
            dependants_first,
            with_dependants,
        } => {
            let mut refs = select_refs(&graph, ActionKind::Deploy, &names)?;
            if with_dependants {
                for dependant in graph.get_dependants_for_many(&refs, true) {
                    if dependant.kind == ActionKind::Deploy && !refs.contains(&dependant) {
                        refs.push(dependant);
                    }
                }
            }
            (refs, dependants_first)
        }
        DeleteTarget::Environment => {
            if !global.yes {
                return Err(GardenError::Parameter(
                    "deleting the whole environment requires confirmation; pass --yes".into(),
                ));
            }
            (select_refs(&graph, ActionKind::Deploy, &[])?, true)
        }
    };
    refs.sort();

    let planner = garden.planner();
    let mut tasks = Vec::new();
    for reference in &refs {
        tasks.push(
            planner
                .task_for(TaskKind::DeleteDeploy, reference)?
                .with_dependants_first(dependants_first),
        );
    }
    let results = garden
        .process_tasks(planner, tasks, cancel.child_token())
        .await?;
    Ok(report(&results))
}

async fn dev(garden: &mut Garden, cancel: CancellationToken) -> Result<i32, GardenError> {
    let refs = select_refs(&garden.graph(), ActionKind::Deploy, &[])?;
    let planner = garden.planner().with_dev_mode(true);
    let mut tasks = Vec::new();
    for reference in &refs {
        tasks.push(planner.task_for(TaskKind::Deploy, reference)?);
    }
    let results = garden
        .process_tasks(planner.clone(), tasks, cancel.child_token())
        .await?;
    report(&results);

    let syncs = DevSyncManager::new(garden.registry(), garden.handler_context());
    syncs
        .sync_started_deploys(&garden.graph(), &results, cancel.child_token())
        .await?;

    let exit = run_watch_loop(garden, dev_change_handler(), cancel.clone()).await;
    syncs.shutdown(&garden.graph()).await?;
    exit?;

    Ok(if cancel.is_cancelled() { 130 } else { 0 })
}

/// Drive the watch loop, re-entering after clean config reloads.
async fn run_watch_loop(
    garden: &mut Garden,
    handler: ChangeHandler,
    cancel: CancellationToken,
) -> Result<WatchExit, GardenError> {
    loop {
        let mut watch = WatchLoop::new(handler.clone()).with_cancellation_token(cancel.clone());
        watch.watch_filesystem(&garden.root().to_path_buf())?;
        let exit = watch.run(garden).await?;
        if !exit.restart_required {
            return Ok(exit);
        }
        tracing::info!("configuration changed; restarting watch loop");
    }
}

/// Deploy-centric change handler: rebuild and redeploy what the change
/// touches.
fn deploy_change_handler() -> ChangeHandler {
    Arc::new(|graph: &ConfigGraph, changed: &ActionRef| {
        let mut tasks = Vec::new();
        match changed.kind {
            ActionKind::Build => {
                tasks.push(forced_task(graph, TaskKind::Build, changed)?);
                for dependant in graph.get_dependants(changed, true) {
                    if dependant.kind == ActionKind::Deploy {
                        tasks.push(forced_task(graph, TaskKind::Deploy, &dependant)?);
                    }
                }
            }
            ActionKind::Deploy => {
                tasks.push(forced_task(graph, TaskKind::Deploy, changed)?);
            }
            ActionKind::Run | ActionKind::Test => {}
        }
        Ok(tasks)
    })
}

/// Test-centric change handler: re-run every test downstream of the change.
fn test_change_handler() -> ChangeHandler {
    Arc::new(|graph: &ConfigGraph, changed: &ActionRef| {
        let mut tasks = Vec::new();
        if changed.kind == ActionKind::Test {
            tasks.push(forced_task(graph, TaskKind::Test, changed)?);
        }
        for dependant in graph.get_dependants(changed, true) {
            if dependant.kind == ActionKind::Test {
                tasks.push(forced_task(graph, TaskKind::Test, &dependant)?);
            }
        }
        Ok(tasks)
    })
}

/// Dev mode redeploys in dev mode so syncs survive.
fn dev_change_handler() -> ChangeHandler {
    let base = deploy_change_handler();
    Arc::new(move |graph: &ConfigGraph, changed: &ActionRef| {
        let tasks = base(graph, changed)?;
        Ok(tasks
            .into_iter()
            .map(|t| {
                if t.kind == TaskKind::Deploy {
                    t.with_dev_mode(true)
                } else {
                    t
                }
            })
            .collect())
    })
}

fn forced_task(
    graph: &ConfigGraph,
    kind: TaskKind,
    reference: &ActionRef,
) -> Result<Task, GardenError> {
    let config = graph.get(reference)?;
    Ok(Task::new(kind, reference.clone(), config.version.clone())
        .with_timeout(config.timeout)
        .with_force(true))
}

/// Print per-task failure sections and the aggregate count; returns the exit
/// code.
fn report(results: &GraphResults) -> i32 {
    let summary = results.summary();
    for result in results.failed() {
        let elapsed = result.elapsed().num_milliseconds() as f64 / 1000.0;
        eprintln!(
            "{}",
            paint_red(&format!(
                "✖ {} [{}] ({:.1}s): {}",
                result.action,
                result.kind,
                elapsed,
                result.error.as_deref().unwrap_or("unknown error")
            ))
        );
    }
    if summary.failed > 0 {
        eprintln!(
            "{}",
            paint_red(&format!(
                "{} task{} failed",
                summary.failed,
                if summary.failed == 1 { "" } else { "s" }
            ))
        );
        1
    } else {
        tracing::info!(
            succeeded = summary.succeeded,
            total = summary.total,
            "done"
        );
        0
    }
}

fn paint_red(text: &str) -> String {
    if std::env::var_os("NO_COLOR").is_some() {
        text.to_string()
    } else {
        format!("\x1b[31m{}\x1b[0m", text)
    }
}
