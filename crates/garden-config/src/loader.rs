//! Project loading: directory scan, multi-document YAML parsing, legacy
//! module conversion.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::{
    ActionKind, ActionRef, ConfigDocument, ConfigError, GroupConfig, ModuleConfig, ProjectConfig,
    RawActionConfig, CONFIG_FILENAMES, CONFIG_SUFFIXES, STATE_DIR,
};

/// Everything parsed out of a project directory.
#[derive(Debug, Clone)]
pub struct ProjectScan {
    pub project: ProjectConfig,
    pub actions: Vec<RawActionConfig>,
    pub groups: Vec<GroupConfig>,
}

/// Whether a file name is recognised as Garden configuration.
pub fn is_config_file_name(name: &str) -> bool {
    CONFIG_FILENAMES.contains(&name) || CONFIG_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Walk upward from `start` to find the directory holding a `Project` doc.
pub fn find_project_root(start: &Path) -> Result<PathBuf, ConfigError> {
    let mut dir = Some(start.to_path_buf());
    while let Some(current) = dir {
        for name in CONFIG_FILENAMES {
            let candidate = current.join(name);
            if candidate.is_file() && file_declares_project(&candidate)? {
                return Ok(current);
            }
        }
        dir = current.parent().map(Path::to_path_buf);
    }
    Err(ConfigError::MissingProject(start.to_path_buf()))
}

fn file_declares_project(path: &Path) -> Result<bool, ConfigError> {
    let content = fs::read_to_string(path)?;
    for document in serde_yaml::Deserializer::from_str(&content) {
        // Look at the kind tag only; other documents may be malformed for
        // reasons the full load will report properly.
        if let Ok(value) = serde_yaml::Value::deserialize(document) {
            if value.get("kind").and_then(|k| k.as_str()) == Some("Project") {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Parse all documents of a single config file.
pub fn load_project_file(path: &Path) -> Result<Vec<ConfigDocument>, ConfigError> {
    let content = fs::read_to_string(path)?;
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&content) {
        let doc = ConfigDocument::deserialize(document).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        documents.push(doc);
    }
    Ok(documents)
}

/// Load a project: scan the directory tree, parse every config file, convert
/// legacy modules, and validate uniqueness.
pub fn load_project(root: &Path) -> Result<ProjectScan, ConfigError> {
    let mut project: Option<ProjectConfig> = None;
    let mut project_path: Option<PathBuf> = None;
    let mut actions: Vec<RawActionConfig> = Vec::new();
    let mut groups: Vec<GroupConfig> = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir() && (name == ".git" || name == STATE_DIR))
        });

    for entry in walker {
        let entry = entry.map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !is_config_file_name(&name) {
            continue;
        }
        let path = entry.path();
        for doc in load_project_file(path)? {
            match doc {
                ConfigDocument::Project(mut p) => {
                    if let Some(prior) = &project_path {
                        return Err(ConfigError::MultipleProjects(
                            prior.clone(),
                            path.to_path_buf(),
                        ));
                    }
                    p.path = path
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| root.to_path_buf());
                    project = Some(p);
                    project_path = Some(path.to_path_buf());
                }
                ConfigDocument::Build(a) => actions.push(with_origin(a, ActionKind::Build, path)),
                ConfigDocument::Deploy(a) => {
                    actions.push(with_origin(a, ActionKind::Deploy, path))
                }
                ConfigDocument::Run(a) => actions.push(with_origin(a, ActionKind::Run, path)),
                ConfigDocument::Test(a) => actions.push(with_origin(a, ActionKind::Test, path)),
                ConfigDocument::Module(m) => {
                    actions.extend(convert_module(m, path));
                }
                ConfigDocument::Group(g) => groups.push(g),
                ConfigDocument::ConfigTemplate(_) | ConfigDocument::RenderTemplate(_) => {
                    tracing::warn!(
                        path = %path.display(),
                        "skipping template document; template expansion is handled elsewhere"
                    );
                }
            }
        }
    }

    let project = project.ok_or_else(|| ConfigError::MissingProject(root.to_path_buf()))?;

    apply_groups(&mut actions, &groups)?;
    apply_varfiles(&mut actions)?;
    check_duplicates(&actions)?;

    tracing::debug!(
        project = %project.name,
        actions = actions.len(),
        groups = groups.len(),
        "project configuration loaded"
    );

    Ok(ProjectScan {
        project,
        actions,
        groups,
    })
}

fn with_origin(mut action: RawActionConfig, kind: ActionKind, path: &Path) -> RawActionConfig {
    action.kind = Some(kind);
    action.source_path = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    action
}

/// Convert a legacy module into one Build action plus its members.
fn convert_module(module: ModuleConfig, path: &Path) -> Vec<RawActionConfig> {
    let mut out = Vec::new();

    let build = RawActionConfig {
        kind: Some(ActionKind::Build),
        type_name: module.type_name.clone(),
        name: module.name.clone(),
        description: module.description.clone(),
        disabled: module.disabled,
        spec: module.spec.clone(),
        variables: module.variables.clone(),
        ..Default::default()
    };
    out.push(with_origin(build, ActionKind::Build, path));

    let member_kinds = [
        (ActionKind::Deploy, &module.services),
        (ActionKind::Run, &module.tasks),
        (ActionKind::Test, &module.tests),
    ];
    for (kind, members) in member_kinds {
        for member in members {
            let action = RawActionConfig {
                kind: Some(kind),
                type_name: module.type_name.clone(),
                name: member.name.clone(),
                disabled: module.disabled || member.disabled,
                dependencies: member.dependencies.clone(),
                build: Some(module.name.clone()),
                spec: member.spec.clone(),
                variables: module.variables.clone(),
                ..Default::default()
            };
            out.push(with_origin(action, kind, path));
        }
    }

    out
}

/// Merge group variables into member actions; action variables win.
fn apply_groups(
    actions: &mut [RawActionConfig],
    groups: &[GroupConfig],
) -> Result<(), ConfigError> {
    let by_name: HashMap<&str, &GroupConfig> =
        groups.iter().map(|g| (g.name.as_str(), g)).collect();

    for action in actions.iter_mut() {
        if let Some(group_name) = &action.group {
            let group = by_name.get(group_name.as_str()).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "action '{}' references unknown group '{}'",
                    action.name, group_name
                ))
            })?;
            action.variables = merge_variables(&group.variables, &action.variables);
            let mut varfiles = group.varfiles.clone();
            varfiles.extend(action.varfiles.iter().cloned());
            action.varfiles = varfiles;
        }
    }
    Ok(())
}

/// Load declared varfiles (YAML mappings, resolved relative to the action's
/// source directory) underneath the action's own variables.
fn apply_varfiles(actions: &mut [RawActionConfig]) -> Result<(), ConfigError> {
    for action in actions.iter_mut() {
        if action.varfiles.is_empty() {
            continue;
        }
        let mut merged = Value::Null;
        for varfile in &action.varfiles {
            let path = action.source_path.join(varfile);
            let content = fs::read_to_string(&path).map_err(|e| {
                ConfigError::Invalid(format!(
                    "action '{}': cannot read varfile {}: {}",
                    action.name,
                    path.display(),
                    e
                ))
            })?;
            let values: Value = serde_yaml::from_str(&content).map_err(|source| {
                ConfigError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;
            if !values.is_object() && !values.is_null() {
                return Err(ConfigError::Invalid(format!(
                    "varfile {} must contain a mapping",
                    path.display()
                )));
            }
            // Later varfiles override earlier ones.
            merged = merge_variables(&merged, &values);
        }
        // Inline variables win over varfile values.
        action.variables = merge_variables(&merged, &action.variables);
    }
    Ok(())
}

/// Shallow object merge; overlay keys win. Null operands pass the other
/// side through.
pub fn merge_variables(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            let mut out = b.clone();
            for (k, v) in o {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        (b, Value::Null) => b.clone(),
        (_, o) => o.clone(),
    }
}

fn check_duplicates(actions: &[RawActionConfig]) -> Result<(), ConfigError> {
    let mut seen: HashMap<ActionRef, &RawActionConfig> = HashMap::new();
    for action in actions {
        let reference = action.reference()?;
        if let Some(prior) = seen.insert(reference.clone(), action) {
            return Err(ConfigError::Duplicate {
                reference: reference.to_string(),
                first: prior.source_path.clone(),
                second: action.source_path.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    const PROJECT_DOC: &str = "\
kind: Project
name: demo
defaultEnvironment: dev
environments:
  - name: dev
    variables:
      hostname: demo.local
";

    #[test]
    fn test_load_project_with_actions() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "garden.yml", PROJECT_DOC);
        write(
            dir.path(),
            "api/api.garden.yml",
            "\
kind: Build
type: exec
name: api
spec:
  command: [\"make\", \"build\"]
---
kind: Deploy
type: exec
name: api
build: api
spec:
  command: [\"make\", \"serve\"]
",
        );

        let scan = load_project(dir.path()).unwrap();
        assert_eq!(scan.project.name, "demo");
        assert_eq!(scan.actions.len(), 2);
        let build = &scan.actions[0];
        assert_eq!(build.kind, Some(ActionKind::Build));
        assert!(build.source_path.ends_with("api"));
    }

    #[test]
    fn test_load_project_skips_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "garden.yml", PROJECT_DOC);
        write(
            dir.path(),
            ".garden/cached/garden.yml",
            "kind: Build\ntype: exec\nname: stale\n",
        );

        let scan = load_project(dir.path()).unwrap();
        assert!(scan.actions.is_empty());
    }

    #[test]
    fn test_duplicate_action_is_rejected_with_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "garden.yml", PROJECT_DOC);
        write(
            dir.path(),
            "a/a.garden.yml",
            "kind: Build\ntype: exec\nname: api\n",
        );
        write(
            dir.path(),
            "b/b.garden.yml",
            "kind: Build\ntype: exec\nname: api\n",
        );

        let err = load_project(dir.path()).unwrap_err();
        match err {
            ConfigError::Duplicate {
                reference,
                first,
                second,
            } => {
                assert_eq!(reference, "build.api");
                assert_ne!(first, second);
            }
            other => panic!("expected duplicate error, got {}", other),
        }
    }

    #[test]
    fn test_module_converts_to_actions() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "garden.yml", PROJECT_DOC);
        write(
            dir.path(),
            "legacy/garden.yml",
            "\
kind: Module
type: exec
name: web
services:
  - name: web
tasks:
  - name: migrate
tests:
  - name: unit
    dependencies: [deploy.web]
",
        );

        let scan = load_project(dir.path()).unwrap();
        let refs: Vec<String> = scan
            .actions
            .iter()
            .map(|a| a.reference().unwrap().to_string())
            .collect();
        assert_eq!(
            refs,
            vec!["build.web", "deploy.web", "run.migrate", "test.unit"]
        );
        // Members consume the module's build.
        assert_eq!(scan.actions[1].build.as_deref(), Some("web"));
        assert_eq!(scan.actions[3].dependencies, vec!["deploy.web"]);
    }

    #[test]
    fn test_group_variables_merge_into_members() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "garden.yml", PROJECT_DOC);
        write(
            dir.path(),
            "svc/garden.yml",
            "\
kind: Group
name: backend
variables:
  log-level: debug
  region: eu
---
kind: Build
type: exec
name: api
group: backend
variables:
  region: us
",
        );

        let scan = load_project(dir.path()).unwrap();
        let action = &scan.actions[0];
        assert_eq!(action.variables["log-level"], "debug");
        // Action-level variable wins over the group's.
        assert_eq!(action.variables["region"], "us");
    }

    #[test]
    fn test_varfiles_load_under_inline_variables() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "garden.yml", PROJECT_DOC);
        write(dir.path(), "svc/dev.env.yml", "log-level: debug\nreplicas: 1\n");
        write(
            dir.path(),
            "svc/garden.yml",
            "\
kind: Deploy
type: exec
name: api
varfiles: [dev.env.yml]
variables:
  replicas: 3
",
        );

        let scan = load_project(dir.path()).unwrap();
        let action = &scan.actions[0];
        assert_eq!(action.variables["log-level"], "debug");
        // Inline variables win over varfile values.
        assert_eq!(action.variables["replicas"], 3);
    }

    #[test]
    fn test_missing_varfile_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "garden.yml", PROJECT_DOC);
        write(
            dir.path(),
            "svc/garden.yml",
            "kind: Deploy\ntype: exec\nname: api\nvarfiles: [nope.yml]\n",
        );
        let err = load_project(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_find_project_root_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "garden.yml", PROJECT_DOC);
        let nested = dir.path().join("services/api");
        fs::create_dir_all(&nested).unwrap();

        let root = find_project_root(&nested).unwrap();
        assert_eq!(
            root.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_missing_project_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_project(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingProject(_)));
    }
}
