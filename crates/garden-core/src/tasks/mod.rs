//! Task model: typed units of work scheduled by the solver.
//!
//! Tasks come in nine kinds: the four execution kinds plus their status
//! counterparts and deploy deletion. Two tasks with equal keys are the same
//! task and are deduplicated by the solver.

mod execute;
mod plan;

pub use execute::{ActionOutputsContext, GardenProcessor, TaskProcessor};
pub use plan::TaskPlanner;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use garden_config::{ActionKind, ActionRef};

/// The nine task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Build,
    BuildStatus,
    Deploy,
    DeployStatus,
    DeleteDeploy,
    Run,
    RunStatus,
    Test,
    TestStatus,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::BuildStatus => "build-status",
            Self::Deploy => "deploy",
            Self::DeployStatus => "deploy-status",
            Self::DeleteDeploy => "delete-deploy",
            Self::Run => "run",
            Self::RunStatus => "run-status",
            Self::Test => "test",
            Self::TestStatus => "test-status",
        }
    }

    /// Whether this is a status/result lookup kind.
    pub fn is_status(&self) -> bool {
        matches!(
            self,
            Self::BuildStatus | Self::DeployStatus | Self::RunStatus | Self::TestStatus
        )
    }

    /// The action kind this task kind operates on.
    pub fn action_kind(&self) -> ActionKind {
        match self {
            Self::Build | Self::BuildStatus => ActionKind::Build,
            Self::Deploy | Self::DeployStatus | Self::DeleteDeploy => ActionKind::Deploy,
            Self::Run | Self::RunStatus => ActionKind::Run,
            Self::Test | Self::TestStatus => ActionKind::Test,
        }
    }

    /// The status kind that gates this execution kind, if any.
    pub fn status_kind(&self) -> Option<TaskKind> {
        match self {
            Self::Build => Some(Self::BuildStatus),
            Self::Deploy => Some(Self::DeployStatus),
            Self::Run => Some(Self::RunStatus),
            Self::Test => Some(Self::TestStatus),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled unit of work: one handler invocation on one action version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub kind: TaskKind,
    pub action: ActionRef,
    /// Content version of the action; part of the dedup key.
    pub version: String,
    /// Bypass status/result short-circuits.
    pub force: bool,
    /// Replace execution prerequisites with status prerequisites.
    pub skip_dependencies: bool,
    /// Deploy in dev mode (sync-enabled).
    pub dev_mode: bool,
    /// DeleteDeploy only: delete dependants before this deploy.
    pub dependants_first: bool,
    /// Timeout in seconds, from the action config.
    pub timeout: Option<u64>,
}

impl Task {
    pub fn new(kind: TaskKind, action: ActionRef, version: impl Into<String>) -> Self {
        Self {
            kind,
            action,
            version: version.into(),
            force: false,
            skip_dependencies: false,
            dev_mode: false,
            dependants_first: false,
            timeout: None,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_skip_dependencies(mut self, skip: bool) -> Self {
        self.skip_dependencies = skip;
        self
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    pub fn with_dependants_first(mut self, dependants_first: bool) -> Self {
        self.dependants_first = dependants_first;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<u64>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dedup key: `<kind>.<action>.<version>`.
    pub fn key(&self) -> String {
        format!("{}.{}.{}", self.kind, self.action, self.version)
    }
}

/// Result status vocabulary shared by tasks and handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Ready,
    Missing,
    Outdated,
    Unknown,
    Unhealthy,
    Stopped,
    Error,
}

impl ResultStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Missing => "missing",
            Self::Outdated => "outdated",
            Self::Unknown => "unknown",
            Self::Unhealthy => "unhealthy",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_key: String,
    pub kind: TaskKind,
    pub action: ActionRef,
    pub version: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub log: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    /// Whether the result was served from a cache or status short-circuit.
    #[serde(default)]
    pub cached: bool,
}

impl TaskResult {
    pub fn started(task: &Task) -> TaskResultBuilder {
        TaskResultBuilder {
            task_key: task.key(),
            kind: task.kind,
            action: task.action.clone(),
            version: task.version.clone(),
            started_at: Utc::now(),
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

/// Builder capturing the start timestamp before the handler runs.
pub struct TaskResultBuilder {
    task_key: String,
    kind: TaskKind,
    action: ActionRef,
    version: String,
    started_at: DateTime<Utc>,
}

impl TaskResultBuilder {
    pub fn finish(self, status: ResultStatus, output: Value, log: String) -> TaskResult {
        TaskResult {
            task_key: self.task_key,
            kind: self.kind,
            action: self.action,
            version: self.version,
            status,
            output,
            log,
            started_at: self.started_at,
            completed_at: Utc::now(),
            error: None,
            cached: false,
        }
    }

    pub fn cached(self, status: ResultStatus, output: Value) -> TaskResult {
        let mut result = self.finish(status, output, String::new());
        result.cached = true;
        result
    }

    pub fn failed(self, error: impl Into<String>) -> TaskResult {
        let mut result = self.finish(ResultStatus::Error, Value::Null, String::new());
        result.error = Some(error.into());
        result
    }
}

/// Results of the direct prerequisites of a task, keyed by task key.
pub type DependencyResults = HashMap<String, TaskResult>;

/// Find a dependency result by task kind and action.
pub fn dependency_result<'a>(
    deps: &'a DependencyResults,
    kind: TaskKind,
    action: &ActionRef,
) -> Option<&'a TaskResult> {
    deps.values()
        .find(|r| r.kind == kind && &r.action == action)
}

/// Final result map of a pass. `None` marks an aborted task (a dependency
/// failed, or the pass was cancelled before it started).
#[derive(Debug, Clone, Default)]
pub struct GraphResults {
    results: BTreeMap<String, Option<TaskResult>>,
}

impl GraphResults {
    pub fn insert(&mut self, key: String, result: Option<TaskResult>) {
        self.results.insert(key, result);
    }

    pub fn get(&self, key: &str) -> Option<&Option<TaskResult>> {
        self.results.get(key)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<TaskResult>)> {
        self.results.iter()
    }

    pub fn completed(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.values().flatten().filter(|r| r.success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.values().flatten().filter(|r| !r.success())
    }

    pub fn aborted_keys(&self) -> impl Iterator<Item = &String> {
        self.results
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k)
    }

    pub fn summary(&self) -> GraphResultSummary {
        GraphResultSummary {
            total: self.len(),
            succeeded: self.completed().count(),
            failed: self.failed().count(),
            aborted: self.aborted_keys().count(),
        }
    }
}

/// Counts per outcome for a drained pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphResultSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_key_format() {
        let task = Task::new(TaskKind::Deploy, ActionRef::deploy("api"), "v-abc123");
        assert_eq!(task.key(), "deploy.deploy.api.v-abc123");
    }

    #[test]
    fn test_equal_keys_mean_same_task() {
        let a = Task::new(TaskKind::Build, ActionRef::build("x"), "v-1").with_force(true);
        let b = Task::new(TaskKind::Build, ActionRef::build("x"), "v-1");
        // Flags do not participate in identity.
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_status_kind_mapping() {
        assert_eq!(TaskKind::Build.status_kind(), Some(TaskKind::BuildStatus));
        assert_eq!(TaskKind::Test.status_kind(), Some(TaskKind::TestStatus));
        assert_eq!(TaskKind::DeleteDeploy.status_kind(), None);
        assert!(TaskKind::RunStatus.is_status());
        assert_eq!(TaskKind::DeployStatus.action_kind(), ActionKind::Deploy);
    }

    #[test]
    fn test_graph_results_summary() {
        let task = Task::new(TaskKind::Build, ActionRef::build("a"), "v-1");
        let ok = TaskResult::started(&task).finish(
            ResultStatus::Ready,
            Value::Null,
            String::new(),
        );
        let failed = TaskResult::started(&task).failed("boom");

        let mut results = GraphResults::default();
        results.insert("k1".into(), Some(ok));
        results.insert("k2".into(), Some(failed));
        results.insert("k3".into(), None);

        let summary = results.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.aborted, 1);
    }
}
