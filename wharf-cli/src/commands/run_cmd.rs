//! `wharf run build|deploy|task|test|workflow <name>` (spec.md §6): runs
//! a single action's terminal handler directly, bypassing status
//! short-circuiting the way `--force` does for a scheduled task.

use anyhow::{bail, Result};
use wharf_core::action::ActionRef;
use wharf_core::solver::CancellationToken;
use wharf_core::task::{Task, TaskKind};

use crate::cli::RunTarget;

use super::{report, run_to_completion};
use crate::expand::GraphExpander;
use crate::session::Engine;

/// Dispatches `target` to the matching single-action run, always with
/// `force: true` (spec.md §6 "`run` ignores any cached result").
pub async fn run(engine: &Engine, target: &RunTarget, cancel: CancellationToken) -> Result<i32> {
    let (kind, name) = match target {
        RunTarget::Build { name } => (TaskKind::Build, name),
        RunTarget::Deploy { name } => (TaskKind::Deploy, name),
        RunTarget::Task { name } => (TaskKind::Run, name),
        RunTarget::Test { name } => (TaskKind::Test, name),
        RunTarget::Workflow { name } => {
            bail!("workflow '{name}' cannot be run directly: multi-action workflows are out of scope for this engine (spec.md Non-goals)");
        }
    };

    let action_ref = ActionRef::new(kind.action_kind(), name.clone());
    let config = engine
        .graph
        .get(&action_ref)
        .ok_or_else(|| anyhow::anyhow!("unknown {} action '{name}'", kind.action_kind()))?;
    let version = engine
        .versions
        .get(&config.action_ref)
        .cloned()
        .unwrap_or_else(|| "unversioned".into());

    let task = Task::new(kind, action_ref, version, true);
    let expander = GraphExpander::new(engine.graph.clone(), engine.versions.clone(), false);
    let results = run_to_completion(engine, vec![task], expander, cancel).await;
    Ok(report::summarize(&results))
}
