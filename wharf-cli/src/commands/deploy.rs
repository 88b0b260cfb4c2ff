//! `wharf deploy [names...]` (spec.md §6, §8 scenario 1).

use anyhow::Result;
use wharf_core::action::ActionKind;
use wharf_core::solver::CancellationToken;
use wharf_core::task::TaskKind;

use super::{report, resolve_targets, run_to_completion};
use crate::expand::GraphExpander;
use crate::session::Engine;

/// Deploys every named Deploy action (or all of them, if `names` is
/// empty), along with their Build/Deploy/Run prerequisites.
pub async fn deploy(engine: &Engine, names: &[String], force: bool, cancel: CancellationToken) -> Result<i32> {
    let targets = resolve_targets(&engine.graph, ActionKind::Deploy, names)?;
    let initial = targets
        .iter()
        .map(|config| {
            let version = engine
                .versions
                .get(&config.action_ref)
                .cloned()
                .unwrap_or_else(|| "unversioned".into());
            wharf_core::task::Task::new(TaskKind::Deploy, config.action_ref.clone(), version, force)
        })
        .collect();

    let expander = GraphExpander::new(engine.graph.clone(), engine.versions.clone(), false);
    let results = run_to_completion(engine, initial, expander, cancel).await;
    Ok(report::summarize(&results))
}
