//! # Garden Exec
//!
//! The `exec` provider: runs actions as local processes. This is the
//! reference implementation of the handler contract, used by the CLI for
//! plain-process projects and by end-to-end tests.
//!
//! Spec fields:
//! - Build: `command: [string]`, `env?: {string: string}`
//! - Deploy: `command`, `statusCommand?`, `cleanupCommand?`, `env?`
//! - Run/Test: `command` (or `args`), `env?`
//!
//! Commands run argv-style (no shell) with the action's source directory as
//! working directory.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use garden_core::prelude::*;
use garden_core::{GardenEvent, HandlerContext, HandlerParams, HandlerResult};

/// Build the exec plugin definition.
pub fn exec_plugin() -> PluginDefinition {
    PluginDefinition::new("exec")
        .with_config_schema(json!({
            "type": "object",
            "properties": {
                "defaultEnv": { "type": "object" }
            }
        }))
        .with_action_type(ActionTypeDefinition::new(
            "exec",
            ActionHandlers::Build(std::sync::Arc::new(ExecBuild)),
        ))
        .with_action_type(ActionTypeDefinition::new(
            "exec",
            ActionHandlers::Deploy(std::sync::Arc::new(ExecDeploy)),
        ))
        .with_action_type(ActionTypeDefinition::new(
            "exec",
            ActionHandlers::Run(std::sync::Arc::new(ExecRun)),
        ))
        .with_action_type(ActionTypeDefinition::new(
            "exec",
            ActionHandlers::Test(std::sync::Arc::new(ExecTest)),
        ))
}

struct CommandOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn log(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

fn spec_command(spec: &Value, key: &str) -> Option<Vec<String>> {
    spec.get(key).and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

/// The command for an action: `command`, falling back to `args`.
fn action_command(spec: &Value) -> Result<Vec<String>, GardenError> {
    let command = spec_command(spec, "command").or_else(|| spec_command(spec, "args"));
    match command {
        Some(argv) if !argv.is_empty() => Ok(argv),
        _ => Err(GardenError::Configuration(
            "exec actions require a non-empty 'command' (or 'args') list in their spec".into(),
        )),
    }
}

fn spec_env(spec: &Value, ctx: &HandlerContext) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = ctx
        .provider_config
        .get("defaultEnv")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    if let Some(obj) = spec.get("env").and_then(|v| v.as_object()) {
        for (k, v) in obj {
            if let Some(s) = v.as_str() {
                env.insert(k.clone(), s.to_string());
            }
        }
    }
    env
}

async fn run_command(
    argv: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<CommandOutput, GardenError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| GardenError::Configuration("empty command".into()))?;

    let mut child = Command::new(program)
        .args(args)
        .envs(env)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| GardenError::Plugin(format!("failed to spawn '{}': {}", program, e)))?;

    // kill_on_drop reaps the child when the losing future is dropped.
    let output = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(GardenError::Cancelled);
        }
        output = child.wait_with_output() => output
            .map_err(|e| GardenError::Plugin(format!("waiting for '{}': {}", program, e)))?,
    };

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
    })
}

fn execution_result(output: CommandOutput) -> HandlerResult {
    let log = output.log();
    let outputs = json!({
        "log": log,
        "exitCode": output.exit_code,
        "success": output.success(),
    });
    if output.success() {
        HandlerResult::ready(outputs)
    } else {
        HandlerResult::new(ResultStatus::Error)
            .with_outputs(outputs)
            .with_detail(format!("command exited with code {}", output.exit_code))
    }
}

struct ExecBuild;

#[async_trait]
impl BuildHandler for ExecBuild {
    async fn build(&self, params: HandlerParams) -> Result<HandlerResult, GardenError> {
        let argv = action_command(&params.action.spec)?;
        let env = spec_env(&params.action.spec, &params.ctx);
        tracing::debug!(action = %params.action.reference(), command = ?argv, "exec build");
        let output = run_command(
            &argv,
            &params.action.config.source_path,
            &env,
            &params.cancel,
        )
        .await?;

        let log = output.log();
        if !log.is_empty() {
            params.ctx.events.publish(GardenEvent::BuildLogChunk {
                action: params.action.reference().clone(),
                chunk: log.clone(),
            });
        }
        Ok(execution_result(output))
    }

    async fn get_status(&self, _params: HandlerParams) -> Result<HandlerResult, GardenError> {
        // Local builds leave no queryable artifact; freshness comes from the
        // session's result cache.
        Ok(HandlerResult::missing())
    }
}

struct ExecDeploy;

#[async_trait]
impl DeployHandler for ExecDeploy {
    async fn deploy(&self, params: HandlerParams) -> Result<HandlerResult, GardenError> {
        let argv = action_command(&params.action.spec)?;
        let env = spec_env(&params.action.spec, &params.ctx);
        tracing::debug!(action = %params.action.reference(), command = ?argv, "exec deploy");
        let output = run_command(
            &argv,
            &params.action.config.source_path,
            &env,
            &params.cancel,
        )
        .await?;
        Ok(execution_result(output))
    }

    async fn get_status(&self, params: HandlerParams) -> Result<HandlerResult, GardenError> {
        let Some(argv) = spec_command(&params.action.spec, "statusCommand") else {
            return Ok(HandlerResult::missing());
        };
        let env = spec_env(&params.action.spec, &params.ctx);
        let output = run_command(
            &argv,
            &params.action.config.source_path,
            &env,
            &params.cancel,
        )
        .await?;
        if output.success() {
            Ok(HandlerResult::ready(json!({"log": output.log()})))
        } else {
            Ok(HandlerResult::missing().with_detail(output.log()))
        }
    }

    async fn delete(&self, params: HandlerParams) -> Result<HandlerResult, GardenError> {
        match spec_command(&params.action.spec, "cleanupCommand") {
            Some(argv) => {
                let env = spec_env(&params.action.spec, &params.ctx);
                let output = run_command(
                    &argv,
                    &params.action.config.source_path,
                    &env,
                    &params.cancel,
                )
                .await?;
                if output.success() {
                    Ok(HandlerResult::new(ResultStatus::Stopped)
                        .with_outputs(json!({"log": output.log()})))
                } else {
                    Ok(HandlerResult::new(ResultStatus::Error)
                        .with_detail(format!("cleanup exited with code {}", output.exit_code)))
                }
            }
            None => Ok(HandlerResult::new(ResultStatus::Stopped)),
        }
    }
}

struct ExecRun;

#[async_trait]
impl RunHandler for ExecRun {
    async fn run(&self, params: HandlerParams) -> Result<HandlerResult, GardenError> {
        let argv = action_command(&params.action.spec)?;
        let env = spec_env(&params.action.spec, &params.ctx);
        tracing::debug!(action = %params.action.reference(), command = ?argv, "exec run");
        let output = run_command(
            &argv,
            &params.action.config.source_path,
            &env,
            &params.cancel,
        )
        .await?;
        Ok(execution_result(output))
    }
}

struct ExecTest;

#[async_trait]
impl TestHandler for ExecTest {
    async fn run(&self, params: HandlerParams) -> Result<HandlerResult, GardenError> {
        let argv = action_command(&params.action.spec)?;
        let env = spec_env(&params.action.spec, &params.ctx);
        tracing::debug!(action = %params.action.reference(), command = ?argv, "exec test");
        let output = run_command(
            &argv,
            &params.action.config.source_path,
            &env,
            &params.cancel,
        )
        .await?;
        Ok(execution_result(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garden_core::{GardenEventBus, GraphBuilder};
    use std::sync::Arc;

    fn params_for(spec: Value, kind: ActionKind, name: &str) -> HandlerParams {
        let mut raw = garden_config::RawActionConfig {
            kind: Some(kind),
            type_name: "exec".to_string(),
            name: name.to_string(),
            ..Default::default()
        };
        raw.spec = spec;
        raw.source_path = std::env::temp_dir();
        let graph = GraphBuilder::new("p").build(vec![raw]).unwrap();
        let config = graph.get(&ActionRef::new(kind, name)).unwrap().clone();

        HandlerParams {
            ctx: Arc::new(HandlerContext {
                project_name: "p".to_string(),
                environment: "dev".to_string(),
                provider_config: Value::Null,
                events: Arc::new(GardenEventBus::default()),
            }),
            action: ResolvedAction {
                spec: config.spec.clone(),
                config,
            },
            runtime: Value::Null,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_run_captures_output() {
        tokio_test::block_on(async {
            let params = params_for(
                json!({"command": ["echo", "hello"]}),
                ActionKind::Run,
                "greet",
            );
            let result = ExecRun.run(params).await.unwrap();
            assert_eq!(result.state, ResultStatus::Ready);
            assert_eq!(result.outputs["log"], json!("hello"));
            assert_eq!(result.outputs["exitCode"], json!(0));
        });
    }

    #[test]
    fn test_failing_command_reports_error_state() {
        tokio_test::block_on(async {
            let params = params_for(
                json!({"command": ["sh", "-c", "exit 3"]}),
                ActionKind::Test,
                "fails",
            );
            let result = ExecTest.run(params).await.unwrap();
            assert_eq!(result.state, ResultStatus::Error);
            assert_eq!(result.outputs["exitCode"], json!(3));
            assert!(result.detail.contains("exited with code 3"));
        });
    }

    #[test]
    fn test_missing_command_is_configuration_error() {
        tokio_test::block_on(async {
            let params = params_for(json!({}), ActionKind::Build, "empty");
            let err = ExecBuild.build(params).await.unwrap_err();
            assert!(matches!(err, GardenError::Configuration(_)));
        });
    }

    #[test]
    fn test_deploy_status_uses_status_command() {
        tokio_test::block_on(async {
            let params = params_for(
                json!({
                    "command": ["true"],
                    "statusCommand": ["sh", "-c", "exit 0"]
                }),
                ActionKind::Deploy,
                "svc",
            );
            let result = ExecDeploy.get_status(params).await.unwrap();
            assert!(result.state.is_ready());

            let params = params_for(
                json!({
                    "command": ["true"],
                    "statusCommand": ["sh", "-c", "exit 1"]
                }),
                ActionKind::Deploy,
                "svc2",
            );
            let result = ExecDeploy.get_status(params).await.unwrap();
            assert_eq!(result.state, ResultStatus::Missing);
        });
    }

    #[test]
    fn test_env_merges_provider_defaults_and_spec() {
        let ctx = HandlerContext {
            project_name: "p".to_string(),
            environment: "dev".to_string(),
            provider_config: json!({"defaultEnv": {"A": "1", "B": "1"}}),
            events: Arc::new(GardenEventBus::default()),
        };
        let env = spec_env(&json!({"env": {"B": "2"}}), &ctx);
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_build_emits_log_chunk_event() {
        tokio_test::block_on(async {
            let params = params_for(
                json!({"command": ["echo", "built!"]}),
                ActionKind::Build,
                "app",
            );
            let mut rx = params.ctx.events.subscribe();
            let result = ExecBuild.build(params).await.unwrap();
            assert!(result.state.is_ready());
            match rx.try_recv() {
                Ok(GardenEvent::BuildLogChunk { chunk, .. }) => assert_eq!(chunk, "built!"),
                other => panic!("expected BuildLogChunk, got {:?}", other),
            }
        });
    }
}
