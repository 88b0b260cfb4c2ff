//! Bridges the [`solver::TaskGraphSolver`] to the [`plugin::PluginRegistry`]:
//! the one [`solver::TaskExecutor`] implementation that resolves an
//! action's spec, short-circuits against the [`cache::ResultCache`], routes
//! to the right handler through the registry's base-chain lookup, and seals
//! the action's outputs back into the shared [`context::LayeredContext`] so
//! later tasks can reference them.
//!
//! Grounded on the teacher's `StateMachine::tick_machine_state`
//! delegating to `Perform::start`/`get_result` (`cloud-conveyor-core::
//! state_machine`/`pipelining`) for the "one place that knows how to turn a
//! scheduled unit of work into a handler call" responsibility, generalized
//! from that module's hard-coded four-action dispatch into a lookup through
//! [`plugin::PluginRegistry`].

use crate::action::ResolvedAction;
use crate::cache::ResultCache;
use crate::context::LayeredContext;
use crate::error::{EngineError, Result};
use crate::graph::{resolve_spec, ConfigGraph};
use crate::plugin::{HandlerContext, PluginRegistry, RuntimeContext};
use crate::solver::{CancellationToken, TaskExecutor};
use crate::task::{GraphResults, Task, TaskKind, TaskOutcome, TaskStatus};
use crate::template::{self, Context, LookupResult, PathSegment, ResolveOptions};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::SystemTime;

/// Wraps the shared [`LayeredContext`], overriding only the `var`/
/// `variables` namespace with one action's own declared variables. Every
/// other namespace falls through to `base` unchanged.
///
/// `LayeredContext` is shared (and mutated, via its interior-mutex layers)
/// across every task in a solver pass; its `variables` field can't be
/// repointed per-action without a race between concurrently-executing
/// tasks, so this wrapper stands in for that one namespace instead.
struct ActionScopedContext<'a> {
    base: &'a LayeredContext,
    variables: template::StaticContext,
}

impl<'a> Context for ActionScopedContext<'a> {
    fn resolve(&self, key_path: &[PathSegment], opts: &ResolveOptions) -> LookupResult {
        match key_path.split_first() {
            Some((PathSegment::Key(head), rest)) if head == "var" || head == "variables" => {
                self.variables.resolve(rest, opts)
            }
            _ => self.base.resolve(key_path, opts),
        }
    }
}

/// The engine's [`TaskExecutor`]: one per [`crate::Session`], shared across
/// every task a solver pass dispatches.
#[derive(Debug)]
pub struct EngineExecutor {
    graph: Arc<ConfigGraph>,
    registry: Arc<PluginRegistry>,
    cache: Arc<ResultCache>,
    context: Arc<LayeredContext>,
    runtime: Arc<RuntimeContext>,
    project_name: String,
}

impl EngineExecutor {
    /// Builds an executor over the given graph, plugin registry, cache, and
    /// shared context. `project_name` is threaded through to handlers for
    /// generated resource naming (spec.md §6.3).
    pub fn new(
        graph: Arc<ConfigGraph>,
        registry: Arc<PluginRegistry>,
        cache: Arc<ResultCache>,
        context: Arc<LayeredContext>,
        runtime: Arc<RuntimeContext>,
        project_name: impl Into<String>,
    ) -> Self {
        Self {
            graph,
            registry,
            cache,
            context,
            runtime,
            project_name: project_name.into(),
        }
    }

    /// Looks up the status/result task corresponding to `task.kind` in
    /// `deps`; if it reports a short-circuitable status and a cache entry
    /// exists for the exact version, returns it instead of re-running the
    /// handler (spec.md §4.5 "skipped if status=ready unless force").
    fn short_circuit(&self, task: &Task, deps: &GraphResults) -> Option<TaskOutcome> {
        let status_kind = match task.kind {
            TaskKind::Build => TaskKind::BuildStatus,
            TaskKind::Deploy => TaskKind::DeployStatus,
            TaskKind::Run => TaskKind::RunResult,
            TaskKind::Test => TaskKind::TestResult,
            _ => return None,
        };
        let status_key = Task::key_for(status_kind, &task.action_ref, &task.version);
        let status_outcome = deps.get(&status_key)?.as_ref()?;
        if !status_outcome.status.is_short_circuitable() {
            return None;
        }
        self.cache.get(task.kind, &task.action_ref, &task.version)
    }

    /// `test --skip-dependencies` (`GraphExpander::with_skip_deploy_dependencies`)
    /// replaces a `Test` task's `Deploy` runtime dependencies with
    /// `DeployStatus` checks instead of full deploys. Those checks are a
    /// probe, not a gate, by themselves: `DeployStatus` "succeeds" (in the
    /// task-graph sense) for any non-error status, including `Missing`,
    /// `Unhealthy`, and `Outdated`. This walks `deps` for exactly the
    /// `DeployStatus` outcomes belonging to `task`'s declared `Deploy`
    /// dependencies and enforces spec.md §8 scenario 2: the test proceeds
    /// only if every one of them reports `Ready`. A normal (non-skip) `Test`
    /// task depends on `Deploy`, not `DeployStatus`, so this is a no-op for
    /// every other path.
    fn require_deploy_dependencies_ready(&self, config: &crate::action::ActionConfig, deps: &GraphResults) -> Result<()> {
        for dep in config.dependencies.iter().filter(|d| d.kind == crate::action::ActionKind::Deploy) {
            let prefix = format!("{}:{}:", TaskKind::DeployStatus, dep);
            for (key, outcome) in deps.iter() {
                if !key.starts_with(&prefix) {
                    continue;
                }
                let status = outcome.as_ref().map(|o| o.status);
                if status != Some(TaskStatus::Ready) {
                    return Err(EngineError::DependencyNotReady {
                        action: config.action_ref.clone(),
                        dependency: dep.clone(),
                        status: status.unwrap_or(TaskStatus::Missing),
                    });
                }
            }
        }
        Ok(())
    }

    fn missing_outcome(&self, task: &Task, status: TaskStatus) -> TaskOutcome {
        let now = SystemTime::now();
        TaskOutcome {
            task_key: task.key.clone(),
            status,
            output: Value::Null,
            log: String::new(),
            started_at: now,
            completed_at: now,
            error: None,
        }
    }

    async fn dispatch_mutation(
        &self,
        task: &Task,
        action_type: &str,
        ctx: &HandlerContext<'_>,
    ) -> Result<TaskOutcome> {
        match task.kind {
            TaskKind::Build => self.registry.build_handler(action_type)?.handler.build(ctx).await,
            TaskKind::Deploy => self.registry.deploy_handler(action_type)?.handler.deploy(ctx).await,
            TaskKind::Run => self.registry.run_handler(action_type)?.handler.run(ctx).await,
            TaskKind::Test => self.registry.test_handler(action_type)?.handler.run(ctx).await,
            TaskKind::DeleteDeploy => {
                match self.registry.deploy_handler(action_type)?.handler.delete(ctx).await? {
                    Some(outcome) => Ok(outcome),
                    None => Ok(self.missing_outcome(task, TaskStatus::Ready)),
                }
            }
            TaskKind::BuildStatus | TaskKind::DeployStatus | TaskKind::RunResult | TaskKind::TestResult => {
                unreachable!("status/result kinds are routed through dispatch_status_or_result")
            }
        }
    }

    async fn dispatch_status_or_result(
        &self,
        task: &Task,
        action_type: &str,
        ctx: &HandlerContext<'_>,
    ) -> Result<TaskOutcome> {
        match task.kind {
            TaskKind::BuildStatus => self.registry.build_handler(action_type)?.handler.get_status(ctx).await,
            TaskKind::DeployStatus => self.registry.deploy_handler(action_type)?.handler.get_status(ctx).await,
            TaskKind::RunResult => {
                match self.registry.run_handler(action_type)?.handler.get_result(ctx).await? {
                    Some(outcome) => Ok(outcome),
                    None => Ok(self.missing_outcome(task, TaskStatus::Missing)),
                }
            }
            TaskKind::TestResult => {
                match self.registry.test_handler(action_type)?.handler.get_result(ctx).await? {
                    Some(outcome) => Ok(outcome),
                    None => Ok(self.missing_outcome(task, TaskStatus::Missing)),
                }
            }
            _ => unreachable!("mutation kinds are routed through dispatch_mutation"),
        }
    }
}

#[async_trait]
impl TaskExecutor for EngineExecutor {
    async fn execute(
        &self,
        task: &Task,
        deps: &GraphResults,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancellation);
        }

        let config = self
            .graph
            .get(&task.action_ref)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("action '{}' not found in graph", task.action_ref)))?;

        let is_status_or_result = task.kind.is_status_or_result();

        if task.kind == TaskKind::Test {
            self.require_deploy_dependencies_ready(&config, deps)?;
        }

        if !is_status_or_result && !task.force {
            if let Some(cached) = self.short_circuit(task, deps) {
                return Ok(cached);
            }
        }

        let scoped = ActionScopedContext {
            base: self.context.as_ref(),
            variables: template::StaticContext::new(Value::Object(config.variables.clone())),
        };
        // Status/result probes run before their action's own build/deploy
        // task, so outputs elsewhere in the graph it references may not be
        // sealed yet; resolve those partially rather than failing.
        let resolved_spec = resolve_spec(&config.spec, &scoped, is_status_or_result)?;
        let resolved = ResolvedAction {
            config: config.clone(),
            resolved_spec,
            version: task.version.clone(),
        };

        let handler_ctx = HandlerContext {
            log: tracing::info_span!("task", kind = %task.kind, action = %task.action_ref),
            provider_config: Value::Null,
            project_name: self.project_name.clone(),
            action: resolved,
            graph: Arc::clone(&self.graph),
            runtime: Arc::clone(&self.runtime),
        };

        let outcome = if is_status_or_result {
            self.dispatch_status_or_result(task, &config.action_type, &handler_ctx).await?
        } else {
            self.dispatch_mutation(task, &config.action_type, &handler_ctx).await?
        };

        if !is_status_or_result && outcome.is_success() {
            self.cache.put(task.kind, task.action_ref.clone(), task.version.clone(), outcome.clone());
            self.context
                .actions
                .seal(task.action_ref.clone(), json!({ "outputs": outcome.output.clone() }));
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionConfig, ActionKind, ActionRef};
    use crate::graph::GraphBuilder;
    use crate::plugin::exec::ExecPlugin;
    use crate::task::Task;
    use serde_json::json;

    fn build_action(name: &str, command: &str) -> ActionConfig {
        ActionConfig {
            action_ref: ActionRef::new(ActionKind::Build, name),
            action_type: "exec".into(),
            source_path: ".".into(),
            dependencies: vec![],
            spec: json!({"command": command, "args": []}),
            disabled: false,
            timeout: None,
            variables: Default::default(),
            template_refs: Default::default(),
        }
    }

    fn make_executor(graph: ConfigGraph) -> EngineExecutor {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(ExecPlugin));
        EngineExecutor::new(
            Arc::new(graph),
            Arc::new(registry),
            Arc::new(ResultCache::new()),
            Arc::new(LayeredContext::new()),
            Arc::new(RuntimeContext {
                project_root: ".".into(),
                working_dir: ".".into(),
                environment: "dev".into(),
                force: false,
                assume_yes: true,
            }),
            "demo",
        )
    }

    #[tokio::test]
    async fn successful_build_task_seals_outputs_and_populates_cache() {
        let config = build_action("api", "true");
        let action_ref = config.action_ref.clone();
        let graph = GraphBuilder::new(vec![config]).build().unwrap();
        let executor = make_executor(graph);

        let task = Task::new(TaskKind::Build, action_ref.clone(), "v1".into(), false);
        let outcome = executor
            .execute(&task, &GraphResults::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert!(executor.context.actions.is_sealed(&action_ref));
        assert!(executor.cache.get(TaskKind::Build, &action_ref, "v1").is_some());
    }

    #[tokio::test]
    async fn ready_status_short_circuits_to_cached_outcome() {
        let config = build_action("api", "true");
        let action_ref = config.action_ref.clone();
        let graph = GraphBuilder::new(vec![config]).build().unwrap();
        let executor = make_executor(graph);

        let cached = TaskOutcome {
            task_key: "build:build.api:v1".into(),
            status: TaskStatus::Ready,
            output: json!({"cached": true}),
            log: String::new(),
            started_at: SystemTime::now(),
            completed_at: SystemTime::now(),
            error: None,
        };
        executor
            .cache
            .put(TaskKind::Build, action_ref.clone(), "v1".into(), cached.clone());

        let status_task = Task::new(TaskKind::BuildStatus, action_ref.clone(), "v1".into(), false);
        let status_outcome = TaskOutcome {
            status: TaskStatus::Ready,
            ..cached.clone()
        };
        let mut deps = GraphResults::new();
        deps.insert(status_task.key.clone(), Some(status_outcome));

        let build_task = Task::new(TaskKind::Build, action_ref, "v1".into(), false)
            .with_deps(vec![status_task.key]);
        let outcome = executor
            .execute(&build_task, &deps, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.output, json!({"cached": true}));
    }

    fn deploy_status_outcome(status: TaskStatus) -> TaskOutcome {
        let now = SystemTime::now();
        TaskOutcome {
            task_key: "deploy-status:deploy.db:v1".into(),
            status,
            output: Value::Null,
            log: String::new(),
            started_at: now,
            completed_at: now,
            error: None,
        }
    }

    #[tokio::test]
    async fn skip_dependencies_test_fails_when_deploy_status_not_ready() {
        let deploy = config(ActionKind::Deploy, "db", vec![]);
        let test = ActionConfig {
            action_ref: ActionRef::new(ActionKind::Test, "t"),
            action_type: "exec".into(),
            source_path: ".".into(),
            dependencies: vec![ActionRef::new(ActionKind::Deploy, "db")],
            spec: json!({"command": "true", "args": []}),
            disabled: false,
            timeout: None,
            variables: Default::default(),
            template_refs: Default::default(),
        };
        let graph = GraphBuilder::new(vec![deploy, test]).build().unwrap();
        let executor = make_executor(graph);

        let status_key = "deploy-status:deploy.db:v1".to_string();
        let mut deps = GraphResults::new();
        deps.insert(status_key, Some(deploy_status_outcome(TaskStatus::Missing)));

        let test_task = Task::new(TaskKind::Test, ActionRef::new(ActionKind::Test, "t"), "v1".into(), false);
        let err = executor
            .execute(&test_task, &deps, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::DependencyNotReady { .. }));
    }

    #[tokio::test]
    async fn skip_dependencies_test_proceeds_when_deploy_status_ready() {
        let deploy = config(ActionKind::Deploy, "db", vec![]);
        let test = ActionConfig {
            action_ref: ActionRef::new(ActionKind::Test, "t"),
            action_type: "exec".into(),
            source_path: ".".into(),
            dependencies: vec![ActionRef::new(ActionKind::Deploy, "db")],
            spec: json!({"command": "true", "args": []}),
            disabled: false,
            timeout: None,
            variables: Default::default(),
            template_refs: Default::default(),
        };
        let graph = GraphBuilder::new(vec![deploy, test]).build().unwrap();
        let executor = make_executor(graph);

        let status_key = "deploy-status:deploy.db:v1".to_string();
        let mut deps = GraphResults::new();
        deps.insert(status_key, Some(deploy_status_outcome(TaskStatus::Ready)));

        let test_task = Task::new(TaskKind::Test, ActionRef::new(ActionKind::Test, "t"), "v1".into(), false);
        let outcome = executor
            .execute(&test_task, &deps, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_success());
    }

    fn config(kind: ActionKind, name: &str, deps: Vec<ActionRef>) -> ActionConfig {
        ActionConfig {
            action_ref: ActionRef::new(kind, name),
            action_type: "exec".into(),
            source_path: ".".into(),
            dependencies: deps,
            spec: json!({"command": "true", "args": []}),
            disabled: false,
            timeout: None,
            variables: Default::default(),
            template_refs: Default::default(),
        }
    }
}
