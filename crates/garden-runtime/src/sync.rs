//! Dev-mode sync manager.
//!
//! When a Deploy action with `spec.devMode.syncs` is successfully deployed in
//! dev mode, a background sync is started through the deploy handler's
//! `start_sync` operation (the external file synchroniser lives behind the
//! handler contract). Syncs outlive any single task; they are keyed by action
//! and torn down on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use garden_config::{dev_mode_spec, ActionRef, SyncSpec};
use garden_core::prelude::*;

/// Tracks active dev-mode syncs per deploy action.
pub struct DevSyncManager {
    registry: Arc<PluginRegistry>,
    handler_ctx: Arc<HandlerContext>,
    active: Mutex<HashMap<ActionRef, Vec<SyncSpec>>>,
}

impl DevSyncManager {
    pub fn new(registry: Arc<PluginRegistry>, handler_ctx: Arc<HandlerContext>) -> Self {
        Self {
            registry,
            handler_ctx,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_refs(&self) -> Vec<ActionRef> {
        let mut refs: Vec<ActionRef> = self
            .active
            .lock()
            .expect("sync registry poisoned")
            .keys()
            .cloned()
            .collect();
        refs.sort();
        refs
    }

    /// Start syncs for every successfully deployed dev-mode action in the
    /// results that declares them. Already-running syncs are left alone.
    pub async fn sync_started_deploys(
        &self,
        graph: &ConfigGraph,
        results: &GraphResults,
        cancel: CancellationToken,
    ) -> Result<(), GardenError> {
        for (_, result) in results.iter() {
            let Some(result) = result else { continue };
            if result.kind != TaskKind::Deploy || !result.success() {
                continue;
            }
            let config = graph.get(&result.action)?;
            let Some(dev_mode) = dev_mode_spec(&config.spec)? else {
                continue;
            };
            if dev_mode.syncs.is_empty() {
                continue;
            }
            self.start(config, dev_mode.syncs, cancel.clone()).await?;
        }
        Ok(())
    }

    /// Start a sync for one action unless one is already running.
    pub async fn start(
        &self,
        config: &ActionConfig,
        syncs: Vec<SyncSpec>,
        cancel: CancellationToken,
    ) -> Result<(), GardenError> {
        {
            let active = self.active.lock().expect("sync registry poisoned");
            if active.contains_key(&config.reference) {
                return Ok(());
            }
        }

        let handlers = self.registry.resolve_deploy(&config.type_name)?;
        let params = self.params(config, cancel);
        match handlers.current().start_sync(params).await? {
            Some(_) => {
                tracing::info!(
                    action = %config.reference,
                    syncs = syncs.len(),
                    "dev-mode sync started"
                );
                self.active
                    .lock()
                    .expect("sync registry poisoned")
                    .insert(config.reference.clone(), syncs);
                Ok(())
            }
            None => {
                tracing::warn!(
                    action = %config.reference,
                    "provider does not implement start_sync; dev-mode sync skipped"
                );
                Ok(())
            }
        }
    }

    /// Tear down every active sync.
    pub async fn shutdown(&self, graph: &ConfigGraph) -> Result<(), GardenError> {
        let drained: Vec<ActionRef> = {
            let mut active = self.active.lock().expect("sync registry poisoned");
            active.drain().map(|(k, _)| k).collect()
        };
        for reference in drained {
            let config = match graph.get(&reference) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let handlers = self.registry.resolve_deploy(&config.type_name)?;
            let params = self.params(config, CancellationToken::new());
            if let Err(e) = handlers.current().stop_sync(params).await {
                tracing::warn!(action = %reference, error = %e, "failed to stop dev-mode sync");
            } else {
                tracing::info!(action = %reference, "dev-mode sync stopped");
            }
        }
        Ok(())
    }

    fn params(&self, config: &ActionConfig, cancel: CancellationToken) -> HandlerParams {
        HandlerParams {
            ctx: self.handler_ctx.clone(),
            action: ResolvedAction {
                config: config.clone(),
                spec: config.spec.clone(),
            },
            runtime: serde_json::Value::Null,
            cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SyncRecorder {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct RecordingDeploy(Arc<SyncRecorder>);

    #[async_trait]
    impl DeployHandler for RecordingDeploy {
        async fn deploy(&self, _params: HandlerParams) -> Result<HandlerResult, GardenError> {
            Ok(HandlerResult::ready(Value::Null))
        }

        async fn delete(&self, _params: HandlerParams) -> Result<HandlerResult, GardenError> {
            Ok(HandlerResult::new(ResultStatus::Stopped))
        }

        async fn start_sync(
            &self,
            _params: HandlerParams,
        ) -> Result<Option<HandlerResult>, GardenError> {
            self.0.started.fetch_add(1, Ordering::SeqCst);
            Ok(Some(HandlerResult::ready(Value::Null)))
        }

        async fn stop_sync(
            &self,
            _params: HandlerParams,
        ) -> Result<Option<HandlerResult>, GardenError> {
            self.0.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(Some(HandlerResult::new(ResultStatus::Stopped)))
        }
    }

    fn fixture() -> (DevSyncManager, Arc<ConfigGraph>, Arc<SyncRecorder>) {
        let recorder = Arc::new(SyncRecorder {
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        });
        let mut registry = PluginRegistry::new();
        registry
            .register(PluginDefinition::new("test").with_action_type(
                ActionTypeDefinition::new(
                    "test",
                    ActionHandlers::Deploy(Arc::new(RecordingDeploy(recorder.clone()))),
                ),
            ))
            .unwrap();

        let mut raw = garden_config::RawActionConfig {
            kind: Some(ActionKind::Deploy),
            type_name: "test".to_string(),
            name: "svc".to_string(),
            ..Default::default()
        };
        raw.spec = json!({
            "devMode": {"syncs": [{"source": "./src", "target": "/app"}]}
        });
        let graph = Arc::new(GraphBuilder::new("p").build(vec![raw]).unwrap());

        let events = Arc::new(GardenEventBus::default());
        let handler_ctx = Arc::new(HandlerContext {
            project_name: "p".to_string(),
            environment: "dev".to_string(),
            provider_config: Value::Null,
            events,
        });
        let manager = DevSyncManager::new(Arc::new(registry), handler_ctx);
        (manager, graph, recorder)
    }

    fn deploy_result(graph: &ConfigGraph) -> GraphResults {
        let reference = ActionRef::deploy("svc");
        let version = graph.get(&reference).unwrap().version.clone();
        let task = Task::new(TaskKind::Deploy, reference, version).with_dev_mode(true);
        let result =
            TaskResult::started(&task).finish(ResultStatus::Ready, Value::Null, String::new());
        let mut results = GraphResults::default();
        results.insert(task.key(), Some(result));
        results
    }

    #[test]
    fn test_sync_started_once_and_torn_down() {
        tokio_test::block_on(async {
            let (manager, graph, recorder) = fixture();
            let results = deploy_result(&graph);

            manager
                .sync_started_deploys(&graph, &results, CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(recorder.started.load(Ordering::SeqCst), 1);
            assert_eq!(manager.active_refs(), vec![ActionRef::deploy("svc")]);

            // A second pass over the same deploy does not restart the sync.
            manager
                .sync_started_deploys(&graph, &results, CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(recorder.started.load(Ordering::SeqCst), 1);

            manager.shutdown(&graph).await.unwrap();
            assert_eq!(recorder.stopped.load(Ordering::SeqCst), 1);
            assert!(manager.active_refs().is_empty());
        });
    }
}
