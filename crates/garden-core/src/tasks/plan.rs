//! Prerequisite expansion: the planning table mapping each task kind to the
//! tasks that must terminate before it starts.

use std::collections::BTreeSet;
use std::sync::Arc;

use garden_config::{ActionKind, ActionRef};

use crate::error::GardenError;
use crate::graph::ConfigGraph;
use crate::tasks::{Task, TaskKind};

/// Derives tasks and their prerequisites from the config graph.
///
/// The planner carries the pass-wide flags: which actions are forced, whether
/// dependency executions are replaced by status checks, and whether deploys
/// run in dev mode.
#[derive(Clone)]
pub struct TaskPlanner {
    graph: Arc<ConfigGraph>,
    force_actions: BTreeSet<ActionRef>,
    skip_dependencies: bool,
    dev_mode: bool,
}

impl TaskPlanner {
    pub fn new(graph: Arc<ConfigGraph>) -> Self {
        Self {
            graph,
            force_actions: BTreeSet::new(),
            skip_dependencies: false,
            dev_mode: false,
        }
    }

    /// Actions whose short-circuits are bypassed.
    pub fn with_force_actions(mut self, refs: impl IntoIterator<Item = ActionRef>) -> Self {
        self.force_actions = refs.into_iter().collect();
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

    pub fn graph(&self) -> &Arc<ConfigGraph> {
        &self.graph
    }

    /// Create a task for `(kind, action)`, reading version and timeout from
    /// the graph.
    pub fn task_for(&self, kind: TaskKind, reference: &ActionRef) -> Result<Task, GardenError> {
        let config = self.graph.get(reference)?;
        if config.kind() != kind.action_kind() {
            return Err(GardenError::Internal(format!(
                "task kind {} cannot target action {}",
                kind, reference
            )));
        }
        Ok(Task::new(kind, reference.clone(), config.version.clone())
            .with_force(self.force_actions.contains(reference))
            .with_skip_dependencies(self.skip_dependencies)
            .with_dev_mode(self.dev_mode && kind.action_kind() == ActionKind::Deploy)
            .with_timeout(config.timeout))
    }

    /// The prerequisite tasks of `task`.
    pub fn prerequisites(&self, task: &Task) -> Result<Vec<Task>, GardenError> {
        let config = self.graph.get(&task.action)?;
        let mut out = Vec::new();

        let deps_of = |kind: ActionKind| -> Vec<ActionRef> {
            config
                .dependencies_of_kind(kind)
                .filter(|r| self.graph.get(r).map(|c| !c.disabled).unwrap_or(false))
                .cloned()
                .collect()
        };

        // Dependency executions degrade to status checks when dependencies
        // are skipped.
        let deploy_kind = if task.skip_dependencies {
            TaskKind::DeployStatus
        } else {
            TaskKind::Deploy
        };
        let run_kind = if task.skip_dependencies {
            TaskKind::RunStatus
        } else {
            TaskKind::Run
        };

        match task.kind {
            TaskKind::BuildStatus => {
                for dep in deps_of(ActionKind::Build) {
                    out.push(self.task_for(TaskKind::BuildStatus, &dep)?);
                }
            }
            TaskKind::Build => {
                out.push(self.task_for(TaskKind::BuildStatus, &task.action)?);
                for dep in deps_of(ActionKind::Build) {
                    out.push(self.task_for(TaskKind::Build, &dep)?);
                }
            }
            TaskKind::DeployStatus => {
                for dep in deps_of(ActionKind::Build) {
                    out.push(self.task_for(TaskKind::BuildStatus, &dep)?);
                }
                for dep in deps_of(ActionKind::Deploy) {
                    out.push(self.task_for(TaskKind::DeployStatus, &dep)?);
                }
                for dep in deps_of(ActionKind::Run) {
                    out.push(self.task_for(TaskKind::RunStatus, &dep)?);
                }
            }
            TaskKind::Deploy => {
                for dep in deps_of(ActionKind::Build) {
                    out.push(self.task_for(TaskKind::Build, &dep)?);
                }
                for dep in deps_of(ActionKind::Deploy) {
                    out.push(self.task_for(deploy_kind, &dep)?);
                }
                for dep in deps_of(ActionKind::Run) {
                    out.push(self.task_for(run_kind, &dep)?);
                }
                out.push(self.task_for(TaskKind::DeployStatus, &task.action)?);
            }
            TaskKind::DeleteDeploy => {
                if task.dependants_first {
                    for dependant in self.graph.get_dependants(&task.action, false) {
                        if dependant.kind != ActionKind::Deploy {
                            continue;
                        }
                        if self.graph.get(&dependant)?.disabled {
                            continue;
                        }
                        out.push(
                            self.task_for(TaskKind::DeleteDeploy, &dependant)?
                                .with_dependants_first(true),
                        );
                    }
                }
            }
            TaskKind::RunStatus | TaskKind::TestStatus => {}
            TaskKind::Run | TaskKind::Test => {
                for dep in deps_of(ActionKind::Build) {
                    out.push(self.task_for(TaskKind::Build, &dep)?);
                }
                for dep in deps_of(ActionKind::Deploy) {
                    out.push(self.task_for(deploy_kind, &dep)?);
                }
                for dep in deps_of(ActionKind::Run) {
                    out.push(self.task_for(run_kind, &dep)?);
                }
                let status_kind = task
                    .kind
                    .status_kind()
                    .ok_or_else(|| GardenError::Internal("run/test has a status kind".into()))?;
                out.push(self.task_for(status_kind, &task.action)?);
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::tests::raw_action;
    use crate::graph::GraphBuilder;

    fn planner(actions: Vec<garden_config::RawActionConfig>) -> TaskPlanner {
        let graph = GraphBuilder::new("p").build(actions).expect("graph");
        TaskPlanner::new(Arc::new(graph))
    }

    fn kinds(tasks: &[Task]) -> Vec<(TaskKind, String)> {
        tasks
            .iter()
            .map(|t| (t.kind, t.action.name.clone()))
            .collect()
    }

    #[test]
    fn test_build_prerequisites() {
        let planner = planner(vec![
            raw_action(ActionKind::Build, "base", &[]),
            raw_action(ActionKind::Build, "app", &["build.base"]),
        ]);
        let task = planner
            .task_for(TaskKind::Build, &ActionRef::build("app"))
            .unwrap();
        let prereqs = planner.prerequisites(&task).unwrap();
        assert_eq!(
            kinds(&prereqs),
            vec![
                (TaskKind::BuildStatus, "app".to_string()),
                (TaskKind::Build, "base".to_string()),
            ]
        );
    }

    #[test]
    fn test_deploy_prerequisites_cover_all_dep_kinds() {
        let mut deploy = raw_action(ActionKind::Deploy, "svc", &["deploy.db", "run.migrate"]);
        deploy.build = Some("img".to_string());
        let planner = planner(vec![
            raw_action(ActionKind::Build, "img", &[]),
            raw_action(ActionKind::Deploy, "db", &[]),
            raw_action(ActionKind::Run, "migrate", &[]),
            deploy,
        ]);

        let task = planner
            .task_for(TaskKind::Deploy, &ActionRef::deploy("svc"))
            .unwrap();
        let prereqs = planner.prerequisites(&task).unwrap();
        assert_eq!(
            kinds(&prereqs),
            vec![
                (TaskKind::Build, "img".to_string()),
                (TaskKind::Deploy, "db".to_string()),
                (TaskKind::Run, "migrate".to_string()),
                (TaskKind::DeployStatus, "svc".to_string()),
            ]
        );
    }

    #[test]
    fn test_skip_dependencies_substitutes_status_tasks() {
        let mut test = raw_action(ActionKind::Test, "e2e", &["deploy.svc"]);
        test.build = Some("img".to_string());
        let planner = planner(vec![
            raw_action(ActionKind::Build, "img", &[]),
            raw_action(ActionKind::Deploy, "svc", &[]),
            test,
        ])
        .with_skip_dependencies(true);

        let task = planner
            .task_for(TaskKind::Test, &ActionRef::test("e2e"))
            .unwrap();
        let prereqs = planner.prerequisites(&task).unwrap();
        assert_eq!(
            kinds(&prereqs),
            vec![
                (TaskKind::Build, "img".to_string()),
                (TaskKind::DeployStatus, "svc".to_string()),
                (TaskKind::TestStatus, "e2e".to_string()),
            ]
        );
    }

    #[test]
    fn test_delete_deploy_dependants_first() {
        let planner = planner(vec![
            raw_action(ActionKind::Deploy, "a", &[]),
            raw_action(ActionKind::Deploy, "b", &["deploy.a"]),
        ]);
        let task = planner
            .task_for(TaskKind::DeleteDeploy, &ActionRef::deploy("a"))
            .unwrap()
            .with_dependants_first(true);
        let prereqs = planner.prerequisites(&task).unwrap();
        assert_eq!(kinds(&prereqs), vec![(TaskKind::DeleteDeploy, "b".to_string())]);
        assert!(prereqs[0].dependants_first);

        // Without the flag, deletion has no prerequisites.
        let plain = planner
            .task_for(TaskKind::DeleteDeploy, &ActionRef::deploy("a"))
            .unwrap();
        assert!(planner.prerequisites(&plain).unwrap().is_empty());
    }

    #[test]
    fn test_disabled_dependencies_are_elided() {
        let mut disabled = raw_action(ActionKind::Deploy, "db", &[]);
        disabled.disabled = true;
        let planner = planner(vec![
            disabled,
            raw_action(ActionKind::Deploy, "svc", &["deploy.db"]),
        ]);
        let task = planner
            .task_for(TaskKind::Deploy, &ActionRef::deploy("svc"))
            .unwrap();
        let prereqs = planner.prerequisites(&task).unwrap();
        assert_eq!(kinds(&prereqs), vec![(TaskKind::DeployStatus, "svc".to_string())]);
    }

    #[test]
    fn test_force_actions_set_force_flag() {
        let planner = planner(vec![raw_action(ActionKind::Build, "app", &[])])
            .with_force_actions([ActionRef::build("app")]);
        let task = planner
            .task_for(TaskKind::Build, &ActionRef::build("app"))
            .unwrap();
        assert!(task.force);
    }

    #[test]
    fn test_status_tasks_have_no_prerequisites_for_run_and_test() {
        let planner = planner(vec![raw_action(ActionKind::Run, "job", &[])]);
        let task = planner
            .task_for(TaskKind::RunStatus, &ActionRef::run("job"))
            .unwrap();
        assert!(planner.prerequisites(&task).unwrap().is_empty());
    }
}
