//! Plugin surface: handler traits and action type definitions.
//!
//! A plugin declares action types for the four kinds and supplies a handler
//! set per type. Handlers are black boxes to the solver; they may shell out
//! or talk to remote systems, and they receive the shared cancellation token.
//! Optional operations return `Ok(None)` when a provider does not implement
//! them; callers treat that as a typed no-op.

mod registry;

pub use registry::{PluginRegistry, ResolvedHandlers};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use garden_config::ActionKind;

use crate::actions::ResolvedAction;
use crate::error::GardenError;
use crate::events::GardenEventBus;
use crate::tasks::ResultStatus;

/// Shared, per-session context handed to every handler invocation.
pub struct HandlerContext {
    pub project_name: String,
    pub environment: String,
    /// Provider-specific configuration, passed through opaquely.
    pub provider_config: Value,
    /// Event bus for streaming log chunks and status updates.
    pub events: Arc<GardenEventBus>,
}

/// Arguments for a single handler call.
pub struct HandlerParams {
    pub ctx: Arc<HandlerContext>,
    pub action: ResolvedAction,
    /// Runtime context: dependency outputs keyed the same way templates
    /// reference them.
    pub runtime: Value,
    pub cancel: CancellationToken,
}

/// Uniform payload returned by handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerResult {
    pub state: ResultStatus,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default)]
    pub detail: String,
}

impl HandlerResult {
    pub fn new(state: ResultStatus) -> Self {
        Self {
            state,
            outputs: Value::Null,
            detail: String::new(),
        }
    }

    pub fn ready(outputs: Value) -> Self {
        Self {
            state: ResultStatus::Ready,
            outputs,
            detail: String::new(),
        }
    }

    pub fn missing() -> Self {
        Self::new(ResultStatus::Missing)
    }

    pub fn outdated() -> Self {
        Self::new(ResultStatus::Outdated)
    }

    pub fn unknown() -> Self {
        Self::new(ResultStatus::Unknown)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_outputs(mut self, outputs: Value) -> Self {
        self.outputs = outputs;
        self
    }
}

/// Handlers for Build actions.
#[async_trait]
pub trait BuildHandler: Send + Sync {
    /// Produce the artifact.
    async fn build(&self, params: HandlerParams) -> Result<HandlerResult, GardenError>;

    /// Report whether the artifact for this version already exists.
    async fn get_status(&self, _params: HandlerParams) -> Result<HandlerResult, GardenError> {
        Ok(HandlerResult::unknown())
    }

    /// Publish the artifact to a remote registry.
    async fn publish(
        &self,
        _params: HandlerParams,
    ) -> Result<Option<HandlerResult>, GardenError> {
        Ok(None)
    }

    /// Run an ad-hoc command in the build environment.
    async fn exec(&self, _params: HandlerParams) -> Result<Option<HandlerResult>, GardenError> {
        Ok(None)
    }
}

/// Handlers for Deploy actions.
#[async_trait]
pub trait DeployHandler: Send + Sync {
    async fn deploy(&self, params: HandlerParams) -> Result<HandlerResult, GardenError>;

    async fn get_status(&self, _params: HandlerParams) -> Result<HandlerResult, GardenError> {
        Ok(HandlerResult::unknown())
    }

    async fn delete(&self, params: HandlerParams) -> Result<HandlerResult, GardenError>;

    async fn exec(&self, _params: HandlerParams) -> Result<Option<HandlerResult>, GardenError> {
        Ok(None)
    }

    async fn get_logs(
        &self,
        _params: HandlerParams,
    ) -> Result<Option<HandlerResult>, GardenError> {
        Ok(None)
    }

    /// Open a port forward to the running service.
    async fn get_port_forward(
        &self,
        _params: HandlerParams,
    ) -> Result<Option<HandlerResult>, GardenError> {
        Ok(None)
    }

    /// Close a previously opened port forward.
    async fn stop_port_forward(
        &self,
        _params: HandlerParams,
    ) -> Result<Option<HandlerResult>, GardenError> {
        Ok(None)
    }

    /// Start a background dev-mode sync for this deploy.
    async fn start_sync(
        &self,
        _params: HandlerParams,
    ) -> Result<Option<HandlerResult>, GardenError> {
        Ok(None)
    }

    /// Tear down a previously started sync.
    async fn stop_sync(
        &self,
        _params: HandlerParams,
    ) -> Result<Option<HandlerResult>, GardenError> {
        Ok(None)
    }
}

/// Handlers for Run actions.
#[async_trait]
pub trait RunHandler: Send + Sync {
    async fn run(&self, params: HandlerParams) -> Result<HandlerResult, GardenError>;

    /// Fetch a previously persisted result for this version, if the plugin
    /// keeps its own result store.
    async fn get_result(
        &self,
        _params: HandlerParams,
    ) -> Result<Option<HandlerResult>, GardenError> {
        Ok(None)
    }
}

/// Handlers for Test actions.
#[async_trait]
pub trait TestHandler: Send + Sync {
    async fn run(&self, params: HandlerParams) -> Result<HandlerResult, GardenError>;

    async fn get_result(
        &self,
        _params: HandlerParams,
    ) -> Result<Option<HandlerResult>, GardenError> {
        Ok(None)
    }
}

/// The handler set backing one action type.
#[derive(Clone)]
pub enum ActionHandlers {
    Build(Arc<dyn BuildHandler>),
    Deploy(Arc<dyn DeployHandler>),
    Run(Arc<dyn RunHandler>),
    Test(Arc<dyn TestHandler>),
}

impl ActionHandlers {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Build(_) => ActionKind::Build,
            Self::Deploy(_) => ActionKind::Deploy,
            Self::Run(_) => ActionKind::Run,
            Self::Test(_) => ActionKind::Test,
        }
    }
}

/// One action type declared by a plugin, e.g. `(Deploy, "exec")`.
#[derive(Clone)]
pub struct ActionTypeDefinition {
    pub type_name: String,
    pub handlers: ActionHandlers,
}

impl ActionTypeDefinition {
    pub fn new(type_name: impl Into<String>, handlers: ActionHandlers) -> Self {
        Self {
            type_name: type_name.into(),
            handlers,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.handlers.kind()
    }
}

/// A plugin: a named bundle of action types, optionally deriving from a base
/// plugin whose types it inherits and may extend.
#[derive(Clone, Default)]
pub struct PluginDefinition {
    pub name: String,
    pub base: Option<String>,
    /// Schema for the provider section of the project config.
    pub config_schema: Value,
    /// Schema for the outputs this plugin exposes to templates.
    pub outputs_schema: Value,
    /// Action types this plugin defines.
    pub action_types: Vec<ActionTypeDefinition>,
    /// Overrides for action types defined elsewhere in the base chain.
    pub extensions: Vec<ActionTypeDefinition>,
}

impl PluginDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn with_config_schema(mut self, schema: Value) -> Self {
        self.config_schema = schema;
        self
    }

    pub fn with_outputs_schema(mut self, schema: Value) -> Self {
        self.outputs_schema = schema;
        self
    }

    pub fn with_action_type(mut self, definition: ActionTypeDefinition) -> Self {
        self.action_types.push(definition);
        self
    }

    pub fn with_extension(mut self, definition: ActionTypeDefinition) -> Self {
        self.extensions.push(definition);
        self
    }
}
