//! Session event bus.
//!
//! One broadcast channel carries both solver lifecycle events and watch-loop
//! requests. The bus pushes to live subscribers only; publishing with no
//! receivers is not an error.

use std::path::PathBuf;

use tokio::sync::broadcast;

use garden_config::ActionRef;

use crate::tasks::{GraphResultSummary, ResultStatus, TaskResult};

/// Events emitted during a session.
#[derive(Debug, Clone)]
pub enum GardenEvent {
    /// A task graph pass started with this many tasks.
    TaskGraphProcessing { count: usize },
    /// A task finished successfully (possibly from cache).
    TaskComplete { key: String, result: TaskResult },
    /// A task failed.
    TaskError { key: String, error: String },
    /// The pass drained; counts per outcome.
    TaskGraphComplete { summary: GraphResultSummary },
    /// A deploy's live status changed.
    DeployStatusUpdate {
        action: ActionRef,
        state: ResultStatus,
    },
    /// A chunk of build log output.
    BuildLogChunk { action: ActionRef, chunk: String },

    /// Watch-loop requests.
    BuildRequested { name: String },
    DeployRequested { name: String },
    TestRequested { name: String },
    TaskRequested { name: String },
    ConfigAdded { path: PathBuf },
    ConfigChanged { path: PathBuf },
    ConfigRemoved { path: PathBuf },
    SourcesChanged { refs: Vec<ActionRef> },
    Restart,
    Exit,
}

/// In-process event bus over a tokio broadcast channel.
pub struct GardenEventBus {
    tx: broadcast::Sender<GardenEvent>,
    capacity: usize,
}

impl GardenEventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish to all active subscribers; lack of subscribers is fine.
    pub fn publish(&self, event: GardenEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GardenEvent> {
        self.tx.subscribe()
    }
}

impl Default for GardenEventBus {
    fn default() -> Self {
        // Enough headroom for bursty solver passes with a slow consumer.
        Self::new(1024)
    }
}
