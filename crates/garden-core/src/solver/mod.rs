//! Task graph solver.
//!
//! Given an initial task list, computes the closure under prerequisites,
//! deduplicates by key, executes respecting dependency order under a global
//! and per-kind concurrency cap, streams lifecycle events, and produces a
//! [`GraphResults`] map. Failures abort dependants transitively while
//! independent branches keep running; command-fatal errors abort the pass.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::GardenError;
use crate::events::{GardenEvent, GardenEventBus};
use crate::tasks::{DependencyResults, GraphResults, Task, TaskKind, TaskProcessor, TaskResult};

/// Solver tuning knobs.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Global worker cap; defaults to the machine's available parallelism.
    pub concurrency: usize,
    /// Per-kind in-flight caps, e.g. deletes capped to spare remote APIs.
    pub kind_limits: HashMap<TaskKind, usize>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let mut kind_limits = HashMap::new();
        kind_limits.insert(TaskKind::DeleteDeploy, 10);
        Self {
            concurrency,
            kind_limits,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Ready,
    Running,
    Complete,
    Failed,
    Aborted,
}

impl NodeState {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Aborted)
    }
}

struct Node {
    task: Task,
    state: NodeState,
    deps: BTreeSet<String>,
    dependants: BTreeSet<String>,
}

/// The concurrent executor over one task set.
pub struct TaskGraph {
    processor: Arc<dyn TaskProcessor>,
    events: Arc<GardenEventBus>,
    config: SolverConfig,
    cancel: CancellationToken,
}

impl TaskGraph {
    pub fn new(processor: Arc<dyn TaskProcessor>, events: Arc<GardenEventBus>) -> Self {
        Self {
            processor,
            events,
            config: SolverConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: SolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts this pass when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the pass to completion.
    pub async fn process(&self, requests: Vec<Task>) -> Result<GraphResults, GardenError> {
        let mut nodes = self.expand(requests)?;
        let mut results = GraphResults::default();

        self.events.publish(GardenEvent::TaskGraphProcessing {
            count: nodes.len(),
        });
        tracing::debug!(tasks = nodes.len(), "task graph pass starting");

        update_ready(&mut nodes);

        let mut in_flight: FuturesUnordered<
            BoxFuture<'_, (String, Result<TaskResult, GardenError>)>,
        > = FuturesUnordered::new();
        let mut running_per_kind: HashMap<TaskKind, usize> = HashMap::new();
        let mut fatal: Option<GardenError> = None;

        loop {
            if fatal.is_none() && !self.cancel.is_cancelled() {
                self.schedule(&mut nodes, &results, &mut in_flight, &mut running_per_kind);
            }

            if in_flight.is_empty() {
                break;
            }

            let Some((key, outcome)) = in_flight.next().await else {
                break;
            };
            let kind = nodes
                .get(&key)
                .map(|n| n.task.kind)
                .ok_or_else(|| GardenError::Internal(format!("unknown task key {}", key)))?;
            if let Some(count) = running_per_kind.get_mut(&kind) {
                *count = count.saturating_sub(1);
            }

            if self.cancel.is_cancelled() {
                // Running tasks finish but their results are discarded.
                set_state(&mut nodes, &key, NodeState::Aborted);
                results.insert(key, None);
                continue;
            }

            match outcome {
                Ok(result) if result.success() => {
                    set_state(&mut nodes, &key, NodeState::Complete);
                    tracing::info!(task = %key, cached = result.cached, "task complete");
                    self.events.publish(GardenEvent::TaskComplete {
                        key: key.clone(),
                        result: result.clone(),
                    });
                    results.insert(key, Some(result));
                    update_ready(&mut nodes);
                }
                Ok(result) => {
                    let error = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "task failed".to_string());
                    tracing::warn!(task = %key, error = %error, "task failed");
                    set_state(&mut nodes, &key, NodeState::Failed);
                    self.events.publish(GardenEvent::TaskError {
                        key: key.clone(),
                        error,
                    });
                    abort_dependants(&mut nodes, &mut results, &key);
                    results.insert(key, Some(result));
                }
                Err(e) => {
                    tracing::error!(task = %key, error = %e, "task errored");
                    set_state(&mut nodes, &key, NodeState::Failed);
                    self.events.publish(GardenEvent::TaskError {
                        key: key.clone(),
                        error: e.to_string(),
                    });
                    abort_dependants(&mut nodes, &mut results, &key);
                    let failed = nodes
                        .get(&key)
                        .map(|n| TaskResult::started(&n.task).failed(e.to_string()));
                    results.insert(key.clone(), failed);
                    if e.is_command_fatal() && fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }

        // Everything not terminal is aborted (cancellation or fatal error).
        for (key, node) in nodes.iter_mut() {
            if !node.state.is_terminal() {
                node.state = NodeState::Aborted;
                results.insert(key.clone(), None);
            }
        }

        let summary = results.summary();
        self.events
            .publish(GardenEvent::TaskGraphComplete { summary });
        tracing::debug!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            aborted = summary.aborted,
            "task graph pass drained"
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Compute the closure under prerequisites, deduplicating by key.
    fn expand(&self, requests: Vec<Task>) -> Result<BTreeMap<String, Node>, GardenError> {
        let mut nodes: BTreeMap<String, Node> = BTreeMap::new();
        let mut queue: VecDeque<Task> = requests.into();

        while let Some(task) = queue.pop_front() {
            let key = task.key();
            if let Some(existing) = nodes.get_mut(&key) {
                // Same key means same task; merge the stronger force flag.
                existing.task.force = existing.task.force || task.force;
                continue;
            }

            let prereqs = self.processor.prerequisites(&task)?;
            let mut deps = BTreeSet::new();
            for prereq in &prereqs {
                deps.insert(prereq.key());
            }
            nodes.insert(
                key.clone(),
                Node {
                    task,
                    state: NodeState::Pending,
                    deps,
                    dependants: BTreeSet::new(),
                },
            );
            for prereq in prereqs {
                let prereq_key = prereq.key();
                match nodes.get_mut(&prereq_key) {
                    Some(node) => {
                        node.dependants.insert(key.clone());
                        node.task.force = node.task.force || prereq.force;
                    }
                    None => queue.push_back(prereq),
                }
            }
        }

        // Wire dependants for edges discovered before their node existed.
        let edges: Vec<(String, String)> = nodes
            .iter()
            .flat_map(|(key, node)| {
                node.deps
                    .iter()
                    .map(|dep| (dep.clone(), key.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (dep, dependant) in edges {
            let node = nodes.get_mut(&dep).ok_or_else(|| {
                GardenError::Internal(format!(
                    "task {} depends on unexpanded task {}",
                    dependant, dep
                ))
            })?;
            node.dependants.insert(dependant);
        }

        Ok(nodes)
    }

    /// Move ready nodes into flight while capacity allows.
    fn schedule<'a>(
        &'a self,
        nodes: &mut BTreeMap<String, Node>,
        results: &GraphResults,
        in_flight: &mut FuturesUnordered<
            BoxFuture<'a, (String, Result<TaskResult, GardenError>)>,
        >,
        running_per_kind: &mut HashMap<TaskKind, usize>,
    ) {
        let ready_keys: Vec<String> = nodes
            .iter()
            .filter(|(_, n)| n.state == NodeState::Ready)
            .map(|(k, _)| k.clone())
            .collect();

        for key in ready_keys {
            if in_flight.len() >= self.config.concurrency {
                break;
            }
            let node = match nodes.get_mut(&key) {
                Some(n) => n,
                None => continue,
            };
            let kind = node.task.kind;
            let kind_running = running_per_kind.get(&kind).copied().unwrap_or(0);
            if let Some(limit) = self.config.kind_limits.get(&kind) {
                if kind_running >= *limit {
                    continue;
                }
            }

            let mut deps = DependencyResults::new();
            for dep_key in &node.deps {
                if let Some(Some(result)) = results.get(dep_key) {
                    deps.insert(dep_key.clone(), result.clone());
                }
            }

            node.state = NodeState::Running;
            *running_per_kind.entry(kind).or_insert(0) += 1;
            let task = node.task.clone();
            let processor = self.processor.clone();
            let cancel = self.cancel.clone();
            tracing::debug!(task = %key, "task started");

            let fut_key = key.clone();
            in_flight.push(Box::pin(async move {
                let outcome = match task.timeout {
                    Some(secs) => {
                        match tokio::time::timeout(
                            Duration::from_secs(secs),
                            processor.process(&task, &deps, cancel),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(GardenError::Timeout(secs)),
                        }
                    }
                    None => processor.process(&task, &deps, cancel).await,
                };
                (fut_key, outcome)
            }));
        }
    }
}

fn update_ready(nodes: &mut BTreeMap<String, Node>) {
    let completed: BTreeSet<String> = nodes
        .iter()
        .filter(|(_, n)| n.state == NodeState::Complete)
        .map(|(k, _)| k.clone())
        .collect();
    for node in nodes.values_mut() {
        if node.state == NodeState::Pending && node.deps.iter().all(|d| completed.contains(d)) {
            node.state = NodeState::Ready;
        }
    }
}

fn set_state(nodes: &mut BTreeMap<String, Node>, key: &str, state: NodeState) {
    if let Some(node) = nodes.get_mut(key) {
        node.state = state;
    }
}

/// Transitively abort everything downstream of a failed task.
fn abort_dependants(nodes: &mut BTreeMap<String, Node>, results: &mut GraphResults, key: &str) {
    let mut queue: VecDeque<String> = nodes
        .get(key)
        .map(|n| n.dependants.iter().cloned().collect())
        .unwrap_or_default();
    while let Some(next) = queue.pop_front() {
        if let Some(node) = nodes.get_mut(&next) {
            if node.state.is_terminal() {
                continue;
            }
            node.state = NodeState::Aborted;
            results.insert(next.clone(), None);
            tracing::debug!(task = %next, "task aborted (dependency failed)");
            queue.extend(node.dependants.iter().cloned());
        }
    }
}
