//! Turns a requested action into the initial [`Task`] list a command
//! schedules, and implements [`TaskExpander`] by walking the config
//! graph's own dependency edges.
//!
//! [`wharf_core::task::prerequisites_for`] models the common
//! Deploy/Run/Test shape (one build dependency, many runtime/task
//! dependencies) from spec.md §4.5's table; this module reuses it for
//! those four kinds and extends it for the two cases it doesn't cover: a
//! raw `Build` action may depend on more than one other `Build` (base
//! images, `copyFrom` chains), and `DeleteDeploy`'s dependants-first
//! ordering (spec.md §8 scenario 4) needs the `--dependants-first` flag,
//! which isn't part of a `Task` and so can't be threaded through
//! `prerequisites_for`'s pure-function signature.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use wharf_core::action::{ActionConfig, ActionKind, ActionRef};
use wharf_core::graph::ConfigGraph;
use wharf_core::solver::TaskExpander;
use wharf_core::task::{self, Task, TaskKind};

/// The one [`TaskExpander`] every `wharf-cli` command builds: resolves a
/// task's declared dependencies against the already-built graph and the
/// versions computed by [`crate::session::Engine::assemble`].
pub struct GraphExpander {
    graph: Arc<ConfigGraph>,
    versions: HashMap<ActionRef, String>,
    /// Whether `DeleteDeploy` should expand to include each action's
    /// dependants as prerequisites (`delete deploy --dependants-first`).
    dependants_first: bool,
    /// Whether a `Test` task's `Deploy` runtime dependencies should be
    /// replaced with a `DeployStatus` check instead of a full deploy
    /// (`test --skip-dependencies`, spec.md §8 scenario 2).
    skip_deploy_dependencies: bool,
}

impl GraphExpander {
    /// Builds an expander over `graph`/`versions`. `dependants_first`
    /// should be `false` for every command except `delete deploy
    /// --dependants-first`.
    pub fn new(
        graph: Arc<ConfigGraph>,
        versions: HashMap<ActionRef, String>,
        dependants_first: bool,
    ) -> Self {
        Self {
            graph,
            versions,
            dependants_first,
            skip_deploy_dependencies: false,
        }
    }

    /// Builds an expander with `test --skip-dependencies` behavior: a
    /// `Test` task's `Deploy` runtime dependencies are expanded to a
    /// `DeployStatus` check rather than a full `Deploy`.
    pub fn with_skip_deploy_dependencies(mut self, skip: bool) -> Self {
        self.skip_deploy_dependencies = skip;
        self
    }

    fn version_of(&self, action_ref: &ActionRef) -> String {
        self.versions
            .get(action_ref)
            .cloned()
            .unwrap_or_else(|| "unversioned".to_string())
    }

    /// Builds a single task for `kind` over `action_ref`, carrying
    /// `force` through.
    pub fn task_for(&self, kind: TaskKind, action_ref: &ActionRef, force: bool) -> Task {
        Task::new(kind, action_ref.clone(), self.version_of(action_ref), force)
    }

    fn build_dep(&self, config: &ActionConfig) -> Option<ActionRef> {
        config
            .dependencies
            .iter()
            .find(|d| d.kind == ActionKind::Build)
            .cloned()
    }

    fn runtime_deps(&self, config: &ActionConfig) -> BTreeSet<ActionRef> {
        config
            .dependencies
            .iter()
            .filter(|d| d.kind != ActionKind::Build)
            .cloned()
            .collect()
    }
}

impl TaskExpander for GraphExpander {
    fn expand(&self, task: &Task) -> Vec<Task> {
        let Some(config) = self.graph.get(&task.action_ref) else {
            return Vec::new();
        };

        if config.action_ref.kind == ActionKind::Build
            && matches!(task.kind, TaskKind::BuildStatus | TaskKind::Build)
        {
            return match task.kind {
                TaskKind::BuildStatus => config
                    .dependencies
                    .iter()
                    .map(|d| self.task_for(TaskKind::BuildStatus, d, task.force))
                    .collect(),
                TaskKind::Build => {
                    let mut out =
                        vec![self.task_for(TaskKind::BuildStatus, &task.action_ref, task.force)];
                    out.extend(
                        config
                            .dependencies
                            .iter()
                            .map(|d| self.task_for(TaskKind::Build, d, task.force)),
                    );
                    out
                }
                _ => unreachable!(),
            };
        }

        if task.kind == TaskKind::DeleteDeploy {
            if !self.dependants_first {
                return Vec::new();
            }
            let dependants = self.graph.get_dependants(&task.action_ref, false);
            return dependants
                .into_iter()
                .filter(|d| d.kind == ActionKind::Deploy)
                .map(|d| self.task_for(TaskKind::DeleteDeploy, &d, task.force))
                .collect();
        }

        if task.kind == TaskKind::Test && self.skip_deploy_dependencies {
            // Substituting `DeployStatus` for `Deploy` here only changes
            // *which* task runs; it does not by itself gate the `Test` on
            // the status it reports (a `DeployStatus` task "succeeds" for
            // any non-error status). `EngineExecutor::require_deploy_
            // dependencies_ready` is what turns a non-`ready` status into
            // the dependency-not-ready failure spec.md §8 scenario 2 calls
            // for.
            let mut out = vec![self.task_for(TaskKind::TestResult, &task.action_ref, task.force)];
            if let Some(b) = self.build_dep(config) {
                out.push(self.task_for(TaskKind::Build, &b, task.force));
            }
            for dep in self.runtime_deps(config) {
                match dep.kind {
                    ActionKind::Deploy => out.push(self.task_for(TaskKind::DeployStatus, &dep, task.force)),
                    ActionKind::Run => out.push(self.task_for(TaskKind::Run, &dep, task.force)),
                    _ => {}
                }
            }
            return out;
        }

        let build_dep = self.build_dep(config);
        let runtime_deps = self.runtime_deps(config);
        let prereqs =
            task::prerequisites_for(task.kind, &task.action_ref, build_dep.as_ref(), &runtime_deps);
        prereqs
            .tasks
            .into_iter()
            .map(|(kind, action_ref)| self.task_for(kind, &action_ref, task.force))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(kind: ActionKind, name: &str, deps: Vec<ActionRef>) -> ActionConfig {
        ActionConfig {
            action_ref: ActionRef::new(kind, name),
            action_type: "exec".into(),
            source_path: ".".into(),
            dependencies: deps,
            spec: json!({}),
            disabled: false,
            timeout: None,
            variables: Default::default(),
            template_refs: Default::default(),
        }
    }

    #[test]
    fn build_expands_to_each_of_several_build_dependencies() {
        let base1 = config(ActionKind::Build, "base1", vec![]);
        let base2 = config(ActionKind::Build, "base2", vec![]);
        let api = config(
            ActionKind::Build,
            "api",
            vec![
                ActionRef::new(ActionKind::Build, "base1"),
                ActionRef::new(ActionKind::Build, "base2"),
            ],
        );
        let graph = Arc::new(
            wharf_core::graph::GraphBuilder::new(vec![base1, base2, api])
                .build()
                .unwrap(),
        );
        let expander = GraphExpander::new(graph, HashMap::new(), false);
        let task = Task::new(TaskKind::Build, ActionRef::new(ActionKind::Build, "api"), "v1".into(), false);
        let prereqs = expander.expand(&task);
        assert_eq!(prereqs.len(), 3); // own BuildStatus + 2 Build deps
        assert!(prereqs
            .iter()
            .any(|t| t.kind == TaskKind::Build && t.action_ref.name == "base1"));
        assert!(prereqs
            .iter()
            .any(|t| t.kind == TaskKind::Build && t.action_ref.name == "base2"));
    }

    #[test]
    fn delete_deploy_without_dependants_first_has_no_prerequisites() {
        let d = config(ActionKind::Deploy, "api", vec![]);
        let graph = Arc::new(wharf_core::graph::GraphBuilder::new(vec![d]).build().unwrap());
        let expander = GraphExpander::new(graph, HashMap::new(), false);
        let task = Task::new(TaskKind::DeleteDeploy, ActionRef::new(ActionKind::Deploy, "api"), "v1".into(), false);
        assert!(expander.expand(&task).is_empty());
    }

    #[test]
    fn delete_deploy_dependants_first_orders_dependant_before_dependency() {
        let a = config(ActionKind::Deploy, "a", vec![]);
        let b = config(
            ActionKind::Deploy,
            "b",
            vec![ActionRef::new(ActionKind::Deploy, "a")],
        );
        let graph = Arc::new(wharf_core::graph::GraphBuilder::new(vec![a, b]).build().unwrap());
        let expander = GraphExpander::new(graph, HashMap::new(), true);
        let task = Task::new(TaskKind::DeleteDeploy, ActionRef::new(ActionKind::Deploy, "a"), "v1".into(), false);
        let prereqs = expander.expand(&task);
        assert_eq!(prereqs.len(), 1);
        assert_eq!(prereqs[0].action_ref.name, "b");
    }
}
