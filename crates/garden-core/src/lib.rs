//! # Garden Core
//!
//! The action graph and task execution engine.
//!
//! This crate contains:
//! - the processed action model and the immutable ConfigGraph
//! - the graph builder (template scanning, implicit dependencies, cycle
//!   detection, content versions)
//! - the plugin registry and handler router (base-chain overrides)
//! - typed tasks with prerequisite planning and handler dispatch
//! - the concurrent task graph solver and the content-addressed result cache
//!
//! This crate does NOT build images, run containers or talk to clusters;
//! handlers supplied by plugins do. It also does not watch files — the
//! runtime crate drives reconcile passes through the engine.

pub mod actions;
pub mod cache;
pub mod error;
pub mod events;
pub mod graph;
pub mod plugin;
pub mod solver;
pub mod tasks;
pub mod version;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::actions::{ActionConfig, ResolvedAction};
    pub use crate::cache::ResultCache;
    pub use crate::error::GardenError;
    pub use crate::events::{GardenEvent, GardenEventBus};
    pub use crate::graph::{ConfigGraph, GraphBuilder};
    pub use crate::plugin::{
        ActionHandlers, ActionTypeDefinition, BuildHandler, DeployHandler, HandlerContext,
        HandlerParams, HandlerResult, PluginDefinition, PluginRegistry, RunHandler, TestHandler,
    };
    pub use crate::solver::{SolverConfig, TaskGraph};
    pub use crate::tasks::{
        DependencyResults, GardenProcessor, GraphResults, ResultStatus, Task, TaskKind,
        TaskPlanner, TaskProcessor, TaskResult,
    };
    pub use garden_config::{ActionKind, ActionRef};
    pub use tokio_util::sync::CancellationToken;
}

// Re-export key types at crate root.
pub use actions::{ActionConfig, ResolvedAction};
pub use cache::ResultCache;
pub use error::GardenError;
pub use events::{GardenEvent, GardenEventBus};
pub use graph::{ConfigGraph, GraphBuilder};
pub use plugin::{
    ActionHandlers, ActionTypeDefinition, BuildHandler, DeployHandler, HandlerContext,
    HandlerParams, HandlerResult, PluginDefinition, PluginRegistry, ResolvedHandlers, RunHandler,
    TestHandler,
};
pub use solver::{SolverConfig, TaskGraph};
pub use tasks::{
    dependency_result, ActionOutputsContext, DependencyResults, GardenProcessor,
    GraphResultSummary, GraphResults, ResultStatus, Task, TaskKind, TaskPlanner, TaskProcessor,
    TaskResult,
};

// Handlers receive this token and are expected to propagate it to their I/O.
pub use tokio_util::sync::CancellationToken;
