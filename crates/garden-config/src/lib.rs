//! # Garden Config
//!
//! Configuration schema and YAML loader for Garden projects.
//!
//! A project is a directory tree of YAML files; each document declares one
//! kind of `Project | Module | Build | Deploy | Run | Test | Group`. Legacy
//! `Module` documents are converted into actions at load time. Template
//! expressions are left untouched here; expansion happens in the graph
//! builder.

mod action;
mod loader;

pub use action::{
    dev_mode_spec, local_mode_enabled, ActionKind, ActionRef, DevModeSpec, RawActionConfig,
    SyncSpec,
};
pub use loader::{
    find_project_root, is_config_file_name, load_project, load_project_file, merge_variables,
    ProjectScan,
};

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Name of the project-local state directory.
pub const STATE_DIR: &str = ".garden";

/// File names recognised as Garden configuration.
pub const CONFIG_FILENAMES: [&str; 2] = ["garden.yml", "garden.yaml"];

/// Suffixes recognised for additional config files (`*.garden.yml`).
pub const CONFIG_SUFFIXES: [&str; 2] = [".garden.yml", ".garden.yaml"];

/// Environment variable selecting the environment (`--env` overrides).
pub const ENV_ENVIRONMENT: &str = "GARDEN_ENV";
/// Environment variable selecting the log level (`--log-level` overrides).
pub const ENV_LOG_LEVEL: &str = "GARDEN_LOG_LEVEL";
/// Environment variable overriding project root discovery.
pub const ENV_PROJECT_ROOT: &str = "GARDEN_PROJECT_ROOT";
/// Environment variable overriding the working directory.
pub const ENV_WORKING_DIR: &str = "GARDEN_WORKING_DIR";

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("duplicate action {reference}: declared in {first} and {second}")]
    Duplicate {
        reference: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("no project configuration found under {0}")]
    MissingProject(PathBuf),
    #[error("multiple project configurations: {0} and {1}")]
    MultipleProjects(PathBuf, PathBuf),
}

/// Project-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
    #[serde(default)]
    pub default_environment: Option<String>,
    #[serde(default)]
    pub variables: Value,
    /// Paths excluded from source watching, project-wide.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(skip)]
    pub path: PathBuf,
}

impl ProjectConfig {
    /// Select an environment by name, falling back to the default.
    pub fn environment(&self, name: Option<&str>) -> Result<Option<&EnvironmentConfig>, ConfigError> {
        let wanted = name
            .map(str::to_string)
            .or_else(|| self.default_environment.clone());
        match wanted {
            Some(wanted) => {
                let env = self.environments.iter().find(|e| e.name == wanted);
                match env {
                    Some(env) => Ok(Some(env)),
                    None => Err(ConfigError::Invalid(format!(
                        "environment '{}' is not declared in project '{}'",
                        wanted, self.name
                    ))),
                }
            }
            None => Ok(self.environments.first()),
        }
    }

    /// Project state directory (`<root>/.garden`).
    pub fn state_dir(&self) -> PathBuf {
        self.path.join(STATE_DIR)
    }
}

/// A named environment with its own variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(default)]
    pub variables: Value,
}

/// A group of actions sharing variables and varfiles.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub variables: Value,
    #[serde(default)]
    pub varfiles: Vec<String>,
}

/// A legacy module: one Build plus zero or more Deploy/Run/Test actions.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub variables: Value,
    /// Build spec of the module.
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub services: Vec<ModuleMember>,
    #[serde(default)]
    pub tasks: Vec<ModuleMember>,
    #[serde(default)]
    pub tests: Vec<ModuleMember>,
}

/// One service/task/test entry of a legacy module.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMember {
    pub name: String,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// One parsed YAML document.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum ConfigDocument {
    Project(ProjectConfig),
    Module(ModuleConfig),
    Build(RawActionConfig),
    Deploy(RawActionConfig),
    Run(RawActionConfig),
    Test(RawActionConfig),
    Group(GroupConfig),
    /// Accepted and skipped; template-document expansion is not a core
    /// concern.
    ConfigTemplate(Value),
    RenderTemplate(Value),
}
