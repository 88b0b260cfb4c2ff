//! The one concrete, in-tree plugin: `exec`. Shells out to a local command
//! for each of the four action kinds, using the action's resolved spec as
//! `{command, args, env}`. This is the one plugin body in scope (spec.md
//! §1: plugin *bodies* like Kubernetes/Helm are external collaborators; an
//! exec-style plugin is simple enough, and necessary enough for testing
//! end-to-end without mocking every handler, to live in-tree).
//!
//! Grounded on the teacher's `BuildSource`/`DeployInfrastructure` trait
//! shape (`cloud-conveyor-core::build`/`deploy`): a thin impl that shells
//! out and maps a process exit code onto the spec's status enum, the same
//! way a real cloud-conveyor provider crate (`cloud-conveyor-aws`) would
//! map a CodeBuild/CloudFormation poll result.

use super::{BuildHandler, DeployHandler, HandlerContext, Plugin, RunHandler, TestHandler};
use crate::error::{EngineError, Result};
use crate::task::{TaskOutcome, TaskStatus};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::SystemTime;
use tracing::{debug, warn};

/// `spec:` shape the `exec` action type expects.
#[derive(Debug, Deserialize)]
struct ExecSpec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: std::collections::BTreeMap<String, String>,
}

fn parse_spec(resolved_spec: &Value) -> Result<ExecSpec> {
    serde_json::from_value(resolved_spec.clone()).map_err(|e| EngineError::Configuration {
        path: "spec".into(),
        message: format!("invalid exec spec: {e}"),
    })
}

async fn run_command(ctx: &HandlerContext<'_>, task_key: &str) -> Result<TaskOutcome> {
    let spec = parse_spec(&ctx.action.resolved_spec)?;
    let started_at = SystemTime::now();
    debug!(command = %spec.command, "exec plugin starting command");

    let mut command = tokio::process::Command::new(&spec.command);
    command.args(&spec.args).envs(&spec.env);

    let timeout = ctx
        .action
        .config
        .timeout
        .unwrap_or(std::time::Duration::from_secs(300));

    let output = tokio::time::timeout(timeout, command.output()).await;
    let completed_at = SystemTime::now();

    let output = match output {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Ok(TaskOutcome {
                task_key: task_key.into(),
                status: TaskStatus::Error,
                output: Value::Null,
                log: String::new(),
                started_at,
                completed_at,
                error: Some(format!("failed to spawn '{}': {e}", spec.command)),
            })
        }
        Err(_) => {
            return Err(EngineError::Timeout(task_key.into()));
        }
    };

    let log = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    if output.status.success() {
        Ok(TaskOutcome {
            task_key: task_key.into(),
            status: TaskStatus::Ready,
            output: json!({ "exit_code": output.status.code() }),
            log,
            started_at,
            completed_at,
            error: None,
        })
    } else {
        warn!(exit_code = ?output.status.code(), "exec plugin command failed");
        Ok(TaskOutcome {
            task_key: task_key.into(),
            status: TaskStatus::Error,
            output: json!({ "exit_code": output.status.code() }),
            log,
            started_at,
            completed_at,
            error: Some(format!(
                "command exited with status {:?}",
                output.status.code()
            )),
        })
    }
}

/// The `exec` plugin: runs the action's configured shell command for
/// whichever handler is invoked, for every action kind.
#[derive(Debug, Default)]
pub struct ExecPlugin;

impl Plugin for ExecPlugin {
    fn name(&self) -> &str {
        "exec"
    }

    fn action_types(&self) -> &[&str] {
        &["exec"]
    }

    fn build_handler(&self, _action_type: &str) -> Option<std::sync::Arc<dyn BuildHandler>> {
        Some(std::sync::Arc::new(ExecPlugin))
    }

    fn deploy_handler(&self, _action_type: &str) -> Option<std::sync::Arc<dyn DeployHandler>> {
        Some(std::sync::Arc::new(ExecPlugin))
    }

    fn run_handler(&self, _action_type: &str) -> Option<std::sync::Arc<dyn RunHandler>> {
        Some(std::sync::Arc::new(ExecPlugin))
    }

    fn test_handler(&self, _action_type: &str) -> Option<std::sync::Arc<dyn TestHandler>> {
        Some(std::sync::Arc::new(ExecPlugin))
    }
}

#[async_trait]
impl BuildHandler for ExecPlugin {
    async fn build(&self, ctx: &HandlerContext<'_>) -> Result<TaskOutcome> {
        run_command(ctx, &format!("build:{}", ctx.action.action_ref())).await
    }

    async fn get_status(&self, ctx: &HandlerContext<'_>) -> Result<TaskOutcome> {
        // exec builds have no artifact store to check; always report
        // `missing` so `Build` always re-runs unless the caller forces a
        // cache via `GetBuildStatus`'s own short-circuit at the task layer.
        Ok(TaskOutcome {
            task_key: format!("build-status:{}", ctx.action.action_ref()),
            status: TaskStatus::Missing,
            output: Value::Null,
            log: String::new(),
            started_at: SystemTime::now(),
            completed_at: SystemTime::now(),
            error: None,
        })
    }
}

#[async_trait]
impl DeployHandler for ExecPlugin {
    async fn deploy(&self, ctx: &HandlerContext<'_>) -> Result<TaskOutcome> {
        run_command(ctx, &format!("deploy:{}", ctx.action.action_ref())).await
    }

    async fn get_status(&self, ctx: &HandlerContext<'_>) -> Result<TaskOutcome> {
        Ok(TaskOutcome {
            task_key: format!("deploy-status:{}", ctx.action.action_ref()),
            status: TaskStatus::Missing,
            output: Value::Null,
            log: String::new(),
            started_at: SystemTime::now(),
            completed_at: SystemTime::now(),
            error: None,
        })
    }

    async fn delete(&self, ctx: &HandlerContext<'_>) -> Result<Option<TaskOutcome>> {
        Ok(Some(TaskOutcome {
            task_key: format!("delete-deploy:{}", ctx.action.action_ref()),
            status: TaskStatus::Ready,
            output: Value::Null,
            log: String::new(),
            started_at: SystemTime::now(),
            completed_at: SystemTime::now(),
            error: None,
        }))
    }
}

#[async_trait]
impl RunHandler for ExecPlugin {
    async fn run(&self, ctx: &HandlerContext<'_>) -> Result<TaskOutcome> {
        run_command(ctx, &format!("run:{}", ctx.action.action_ref())).await
    }

    async fn get_result(&self, _ctx: &HandlerContext<'_>) -> Result<Option<TaskOutcome>> {
        Ok(None) // exec plugin has no persistent result store; always re-run
    }
}

#[async_trait]
impl TestHandler for ExecPlugin {
    async fn run(&self, ctx: &HandlerContext<'_>) -> Result<TaskOutcome> {
        run_command(ctx, &format!("test:{}", ctx.action.action_ref())).await
    }

    async fn get_result(&self, _ctx: &HandlerContext<'_>) -> Result<Option<TaskOutcome>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionConfig, ActionKind, ActionRef, ResolvedAction};
    use crate::graph::GraphBuilder;
    use std::sync::Arc;

    fn ctx(spec: Value) -> (HandlerHolder, ExecPlugin) {
        let config = ActionConfig {
            action_ref: ActionRef::new(ActionKind::Run, "hello"),
            action_type: "exec".into(),
            source_path: ".".into(),
            dependencies: vec![],
            spec: spec.clone(),
            disabled: false,
            timeout: None,
            variables: Default::default(),
            template_refs: Default::default(),
        };
        let resolved = ResolvedAction {
            config: config.clone(),
            resolved_spec: spec,
            version: "v1".into(),
        };
        let graph = GraphBuilder::new(vec![config]).build().unwrap();
        let holder = HandlerHolder {
            graph: Arc::new(graph),
            runtime: Arc::new(crate::plugin::RuntimeContext {
                project_root: ".".into(),
                working_dir: ".".into(),
                environment: "dev".into(),
                force: false,
                assume_yes: true,
            }),
            action: resolved,
        };
        (holder, ExecPlugin)
    }

    struct HandlerHolder {
        graph: Arc<crate::graph::ConfigGraph>,
        runtime: Arc<crate::plugin::RuntimeContext>,
        action: ResolvedAction,
    }

    impl HandlerHolder {
        fn as_ctx(&self) -> HandlerContext<'_> {
            HandlerContext {
                log: tracing::Span::none(),
                provider_config: Value::Null,
                project_name: "demo".into(),
                action: self.action.clone(),
                graph: Arc::clone(&self.graph),
                runtime: Arc::clone(&self.runtime),
            }
        }
    }

    #[tokio::test]
    async fn successful_command_reports_ready() {
        let (holder, plugin) = ctx(json!({"command": "true", "args": []}));
        let outcome = plugin.run(&holder.as_ctx()).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Ready);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn failing_command_reports_error() {
        let (holder, plugin) = ctx(json!({"command": "false", "args": []}));
        let outcome = plugin.run(&holder.as_ctx()).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Error);
        assert!(outcome.error.is_some());
    }
}
