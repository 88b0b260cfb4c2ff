//! `wharf test [names...] [--watch] [--skip-dependencies]` (spec.md §6,
//! §8 scenario 2).

use anyhow::Result;
use std::sync::Arc;
use wharf_core::action::ActionKind;
use wharf_core::solver::CancellationToken;
use wharf_core::task::{Task, TaskKind};

use super::{report, resolve_targets, run_to_completion};
use crate::expand::GraphExpander;
use crate::session::Engine;

/// Runs every named Test action (or all of them), optionally skipping a
/// full redeploy of their `Deploy` dependencies in favor of a status
/// check, and optionally re-running on every watched source change.
pub async fn test(
    engine: &Engine,
    names: &[String],
    watch: bool,
    skip_dependencies: bool,
    force: bool,
    cancel: CancellationToken,
) -> Result<i32> {
    let targets = resolve_targets(&engine.graph, ActionKind::Test, names)?;
    let initial: Vec<Task> = targets
        .iter()
        .map(|config| {
            let version = engine
                .versions
                .get(&config.action_ref)
                .cloned()
                .unwrap_or_else(|| "unversioned".into());
            Task::new(TaskKind::Test, config.action_ref.clone(), version, force)
        })
        .collect();

    let expander = GraphExpander::new(engine.graph.clone(), engine.versions.clone(), false)
        .with_skip_deploy_dependencies(skip_dependencies);
    let results = run_to_completion(engine, initial, expander, cancel.clone()).await;
    let mut exit_code = report::summarize(&results);
    if report::any_failed(&results, TaskKind::Test) {
        exit_code = 1;
    }

    if watch {
        tracing::info!("entering watch mode; re-running affected tests on source changes");
        let target_refs: Vec<_> = targets.iter().map(|c| c.action_ref.clone()).collect();
        let roots = crate::watch_setup::watched_roots(engine, &target_refs);
        let (bus_tx, bus_rx) = tokio::sync::mpsc::unbounded_channel();
        let (task_tx, mut task_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<Task>>();
        let _watcher = wharf_core::watch::SourceWatcher::start(roots, bus_tx)?;

        let graph = engine.graph.clone();
        let versions = engine.versions.clone();
        let skip_dependencies_for_watch = skip_dependencies;
        let handler = Arc::new(move |_graph: &wharf_core::graph::ConfigGraph, changed: &wharf_core::action::ActionRef| {
            if changed.kind != ActionKind::Test {
                return Vec::new();
            }
            let version = versions.get(changed).cloned().unwrap_or_else(|| "unversioned".into());
            vec![Task::new(TaskKind::Test, changed.clone(), version, false)]
        });
        let reloader = Arc::new(NoopReloader);
        let watch_cancel = cancel.clone();
        tokio::spawn(wharf_core::watch::run(bus_rx, graph, handler, reloader, task_tx, watch_cancel));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                tasks = task_rx.recv() => {
                    let Some(tasks) = tasks else { break };
                    let expander = GraphExpander::new(engine.graph.clone(), engine.versions.clone(), false)
                        .with_skip_deploy_dependencies(skip_dependencies_for_watch);
                    let results = run_to_completion(engine, tasks, expander, cancel.clone()).await;
                    exit_code = report::summarize(&results);
                }
            }
        }
    }

    Ok(exit_code)
}

struct NoopReloader;

impl wharf_core::watch::ConfigReloader for NoopReloader {
    fn reload(&self) -> wharf_core::error::Result<wharf_core::graph::ConfigGraph> {
        Err(wharf_core::error::EngineError::Internal(
            "config reload is not supported from `test --watch`; use `dev` for full reconciliation".into(),
        ))
    }
}
