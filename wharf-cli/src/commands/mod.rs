//! Command implementations (spec.md §6 "CLI surface"). Each command
//! resolves its target actions against the already-built graph, builds
//! the initial task list, runs the [`wharf_core::solver::TaskGraphSolver`]
//! to completion, and reports the result.
//!
//! Grounded on the teacher's `cloud-conveyor-cli::commands::check` — one
//! function per subcommand that assembles state, drives the engine, and
//! turns the outcome into a process exit code — generalized across the
//! five subcommands this spec adds.

mod delete;
mod deploy;
mod dev;
mod report;
mod run_cmd;
mod test_cmd;

pub use delete::delete;
pub use deploy::deploy;
pub use dev::dev;
pub use run_cmd::run;
pub use test_cmd::test;

use std::sync::Arc;
use wharf_core::action::{ActionConfig, ActionKind, ActionRef};
use wharf_core::executor::EngineExecutor;
use wharf_core::graph::ConfigGraph;
use wharf_core::solver::{CancellationToken, ConcurrencyLimits, SolverEvent, TaskGraphSolver};
use wharf_core::task::{GraphResults, Task};

use crate::expand::GraphExpander;
use crate::session::Engine;

/// Resolves `names` (empty meaning "all") against every declared action of
/// `kind`, erroring on an unknown name (spec.md §6 "an unrecognized action
/// name is a parameter error").
pub fn resolve_targets<'a>(
    graph: &'a ConfigGraph,
    kind: ActionKind,
    names: &[String],
) -> anyhow::Result<Vec<&'a ActionConfig>> {
    if names.is_empty() {
        return Ok(graph.get_actions(None, |a| a.action_ref.kind == kind && !a.disabled));
    }
    names
        .iter()
        .map(|name| {
            let action_ref = ActionRef::new(kind, name.clone());
            graph
                .get(&action_ref)
                .filter(|a| !a.disabled)
                .ok_or_else(|| anyhow::anyhow!("unknown {kind} action '{name}'"))
        })
        .collect()
}

/// Drives `initial` through a fresh [`TaskGraphSolver`] pass, logging each
/// event as it arrives, and returns the final results.
pub async fn run_to_completion(
    engine: &Engine,
    initial: Vec<Task>,
    expander: GraphExpander,
    cancel: CancellationToken,
) -> GraphResults {
    let expander: Arc<GraphExpander> = Arc::new(expander);
    let executor: Arc<EngineExecutor> = Arc::new(EngineExecutor::new(
        engine.graph.clone(),
        engine.registry.clone(),
        engine.cache.clone(),
        engine.context.clone(),
        engine.runtime.clone(),
        engine.project_name.clone(),
    ));
    let solver = TaskGraphSolver::new(ConcurrencyLimits::host_default());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SolverEvent>();

    let solve = solver.solve(initial, expander, executor, cancel, tx);
    tokio::pin!(solve);

    loop {
        tokio::select! {
            results = &mut solve => return results,
            event = rx.recv() => {
                if let Some(event) = event {
                    report::log_event(&event);
                }
            }
        }
    }
}
