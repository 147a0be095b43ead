//! Action configuration types.
//!
//! These are the raw, unresolved shapes parsed from YAML documents. Template
//! expansion and validation happen later, in the graph builder.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ConfigError;

/// The four action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Build,
    Deploy,
    Run,
    Test,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [Self::Build, Self::Deploy, Self::Run, Self::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Deploy => "deploy",
            Self::Run => "run",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "build" => Ok(Self::Build),
            "deploy" => Ok(Self::Deploy),
            "run" => Ok(Self::Run),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::Invalid(format!(
                "unknown action kind '{}'",
                other
            ))),
        }
    }
}

/// Globally unique action reference: `(kind, name)`, rendered `kind.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionRef {
    pub kind: ActionKind,
    pub name: String,
}

impl ActionRef {
    pub fn new(kind: ActionKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn build(name: impl Into<String>) -> Self {
        Self::new(ActionKind::Build, name)
    }

    pub fn deploy(name: impl Into<String>) -> Self {
        Self::new(ActionKind::Deploy, name)
    }

    pub fn run(name: impl Into<String>) -> Self {
        Self::new(ActionKind::Run, name)
    }

    pub fn test(name: impl Into<String>) -> Self {
        Self::new(ActionKind::Test, name)
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl FromStr for ActionRef {
    type Err = ConfigError;

    /// Parse a dependency string of the form `<kind>.<name>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s.split_once('.').ok_or_else(|| {
            ConfigError::Invalid(format!(
                "invalid action reference '{}': expected <kind>.<name>",
                s
            ))
        })?;
        if name.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "invalid action reference '{}': empty name",
                s
            )));
        }
        Ok(Self {
            kind: kind.parse()?,
            name: name.to_string(),
        })
    }
}

/// A raw action configuration as parsed from a YAML document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawActionConfig {
    #[serde(skip)]
    pub kind: Option<ActionKind>,
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Dependency strings of the form `<kind>.<name>`.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Build action this action consumes (Deploy/Run/Test only).
    #[serde(default)]
    pub build: Option<String>,
    /// Copy build context from another Build action (Build only).
    #[serde(default)]
    pub copy_from: Option<String>,
    /// Whether the built artifact may be published (Build only).
    #[serde(default)]
    pub allow_publish: Option<bool>,
    /// Plugin-specific spec; template expressions allowed in any string.
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub variables: Value,
    #[serde(default)]
    pub varfiles: Vec<String>,
    /// Per-action timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Optional group this action belongs to.
    #[serde(default)]
    pub group: Option<String>,
    /// Paths excluded from source watching.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(skip)]
    pub source_path: PathBuf,
}

impl RawActionConfig {
    /// The action's reference; the loader guarantees `kind` is set.
    pub fn reference(&self) -> Result<ActionRef, ConfigError> {
        let kind = self.kind.ok_or_else(|| {
            ConfigError::Invalid(format!("action '{}' has no kind assigned", self.name))
        })?;
        Ok(ActionRef::new(kind, self.name.clone()))
    }

    /// Parse the declared dependency strings.
    pub fn dependency_refs(&self) -> Result<Vec<ActionRef>, ConfigError> {
        self.dependencies.iter().map(|d| d.parse()).collect()
    }
}

/// `spec.devMode` for Deploy actions.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevModeSpec {
    #[serde(default)]
    pub syncs: Vec<SyncSpec>,
}

/// One dev-mode file sync declaration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
    #[serde(default = "default_directory_mode")]
    pub directory_mode: u32,
}

fn default_file_mode() -> u32 {
    0o600
}

fn default_directory_mode() -> u32 {
    0o700
}

/// Extract the devMode section of a Deploy spec, if declared.
pub fn dev_mode_spec(spec: &Value) -> Result<Option<DevModeSpec>, ConfigError> {
    match spec.get("devMode") {
        Some(v) if !v.is_null() => {
            let parsed: DevModeSpec = serde_json::from_value(v.clone()).map_err(|e| {
                ConfigError::Invalid(format!("invalid devMode spec: {}", e))
            })?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}

/// Whether a Deploy spec requests local mode.
pub fn local_mode_enabled(spec: &Value) -> bool {
    spec.get("localMode")
        .map(|v| !v.is_null() && v.get("enabled").and_then(Value::as_bool) != Some(false))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_ref_parse_and_display() {
        let r: ActionRef = "deploy.api".parse().unwrap();
        assert_eq!(r, ActionRef::deploy("api"));
        assert_eq!(r.to_string(), "deploy.api");

        assert!("nonsense".parse::<ActionRef>().is_err());
        assert!("widget.api".parse::<ActionRef>().is_err());
        assert!("build.".parse::<ActionRef>().is_err());
    }

    #[test]
    fn test_dev_mode_spec_defaults_modes() {
        let spec = json!({
            "devMode": {
                "syncs": [{"source": "./src", "target": "/app/src"}]
            }
        });
        let parsed = dev_mode_spec(&spec).unwrap().unwrap();
        assert_eq!(parsed.syncs.len(), 1);
        assert_eq!(parsed.syncs[0].file_mode, 0o600);
        assert_eq!(parsed.syncs[0].directory_mode, 0o700);
    }

    #[test]
    fn test_dev_mode_spec_absent() {
        assert_eq!(dev_mode_spec(&json!({"ports": []})).unwrap(), None);
    }

    #[test]
    fn test_local_mode_flag() {
        assert!(local_mode_enabled(&json!({"localMode": {}})));
        assert!(!local_mode_enabled(&json!({"localMode": {"enabled": false}})));
        assert!(!local_mode_enabled(&json!({})));
    }
}
