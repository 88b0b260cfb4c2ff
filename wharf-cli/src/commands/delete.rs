//! `wharf delete deploy|environment|secret` (spec.md §6, §8 scenario 4).

use anyhow::{bail, Result};
use wharf_core::action::{ActionKind, ActionRef};
use wharf_core::solver::CancellationToken;
use wharf_core::task::{Task, TaskKind};

use crate::cli::{DeleteDeployArgs, DeleteTarget};

use super::{report, resolve_targets, run_to_completion};
use crate::expand::GraphExpander;
use crate::session::Engine;

/// Dispatches `target` to the matching teardown.
pub async fn delete(engine: &Engine, target: &DeleteTarget, force: bool, cancel: CancellationToken) -> Result<i32> {
    match target {
        DeleteTarget::Deploy(args) => delete_deploy(engine, args, force, cancel).await,
        DeleteTarget::Environment { name } => delete_environment(engine, name.as_deref(), force, cancel).await,
        DeleteTarget::Secret { key } => delete_secret(engine, key),
    }
}

async fn delete_deploy(engine: &Engine, args: &DeleteDeployArgs, force: bool, cancel: CancellationToken) -> Result<i32> {
    let mut targets: Vec<ActionRef> = resolve_targets(&engine.graph, ActionKind::Deploy, &args.names)?
        .into_iter()
        .map(|c| c.action_ref.clone())
        .collect();

    if args.with_dependants {
        let mut with_dependants = targets.clone();
        for action_ref in &targets {
            with_dependants.extend(
                engine
                    .graph
                    .get_dependants(action_ref, true)
                    .into_iter()
                    .filter(|d| d.kind == ActionKind::Deploy),
            );
        }
        with_dependants.sort();
        with_dependants.dedup();
        targets = with_dependants;
    }

    let initial: Vec<Task> = targets
        .iter()
        .map(|action_ref| {
            let version = engine
                .versions
                .get(action_ref)
                .cloned()
                .unwrap_or_else(|| "unversioned".into());
            Task::new(TaskKind::DeleteDeploy, action_ref.clone(), version, force)
        })
        .collect();

    let expander = GraphExpander::new(engine.graph.clone(), engine.versions.clone(), args.dependants_first);
    let results = run_to_completion(engine, initial, expander, cancel).await;
    Ok(report::summarize(&results))
}

async fn delete_environment(engine: &Engine, name: Option<&str>, force: bool, cancel: CancellationToken) -> Result<i32> {
    let environment = name.unwrap_or(&engine.runtime.environment);
    if environment != engine.runtime.environment {
        bail!(
            "deleting a non-active environment ('{}') is not supported by this engine; re-run with --env {}",
            environment,
            environment
        );
    }

    let targets = resolve_targets(&engine.graph, ActionKind::Deploy, &[])?;
    let initial: Vec<Task> = targets
        .iter()
        .map(|config| {
            let version = engine
                .versions
                .get(&config.action_ref)
                .cloned()
                .unwrap_or_else(|| "unversioned".into());
            Task::new(TaskKind::DeleteDeploy, config.action_ref.clone(), version, force)
        })
        .collect();

    let expander = GraphExpander::new(engine.graph.clone(), engine.versions.clone(), true);
    let results = run_to_completion(engine, initial, expander, cancel).await;
    Ok(report::summarize(&results))
}

fn delete_secret(engine: &Engine, key: &str) -> Result<i32> {
    bail!(
        "secret '{key}' cannot be deleted for environment '{}': secret storage is a provider concern, out of scope for this engine (spec.md Non-goals)",
        engine.runtime.environment
    )
}
