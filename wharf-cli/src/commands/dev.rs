//! `wharf dev [names...]` (spec.md §4.8 "Watch & Reconcile Loop"): deploys
//! the named (or all) Deploy actions, starts dev-mode syncs for any that
//! declare one, then watches sources and reconciles until cancelled or a
//! config change triggers a restart.

use anyhow::Result;
use std::sync::Arc;
use wharf_core::action::{ActionConfig, ActionKind, ActionRef};
use wharf_core::solver::CancellationToken;
use wharf_core::task::{Task, TaskKind};
use wharf_core::watch::{self, BusMessage, SyncRegistry, WatchOutcome};

use super::{report, resolve_targets, run_to_completion};
use crate::expand::GraphExpander;
use crate::session::Engine;
use crate::watch_setup::watched_roots;

/// Runs one full dev session: initial deploy, sync startup, then the
/// reconcile loop. Returns once cancelled or the loop exits without a
/// restart being requested; a config-change restart re-enters this
/// function's caller (see `main.rs`).
pub async fn dev(engine: &Engine, names: &[String], cancel: CancellationToken) -> Result<i32> {
    let targets = resolve_targets(&engine.graph, ActionKind::Deploy, names)?;
    let target_refs: Vec<ActionRef> = targets.iter().map(|c| c.action_ref.clone()).collect();

    let initial: Vec<Task> = targets
        .iter()
        .map(|config| {
            let version = engine
                .versions
                .get(&config.action_ref)
                .cloned()
                .unwrap_or_else(|| "unversioned".into());
            Task::new(TaskKind::Deploy, config.action_ref.clone(), version, false)
        })
        .collect();

    let expander = GraphExpander::new(engine.graph.clone(), engine.versions.clone(), false);
    let results = run_to_completion(engine, initial, expander, cancel.clone()).await;
    let mut exit_code = report::summarize(&results);

    let syncs = Arc::new(SyncRegistry::new());
    for config in &targets {
        if let Some(outcome) = results.get(&Task::key_for(
            TaskKind::Deploy,
            &config.action_ref,
            engine.versions.get(&config.action_ref).map(String::as_str).unwrap_or(""),
        )) {
            if outcome.as_ref().map(|o| o.is_success()).unwrap_or(false) {
                start_sync_if_declared(&syncs, config).await;
            }
        }
    }

    tracing::info!(targets = target_refs.len(), "dev deploy complete, entering watch loop");

    let roots = watched_roots(engine, &target_refs);
    let (bus_tx, bus_rx) = tokio::sync::mpsc::unbounded_channel::<BusMessage>();
    let (task_tx, mut task_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<Task>>();
    let _watcher = watch::SourceWatcher::start(roots, bus_tx)?;

    let graph_for_handler = engine.graph.clone();
    let versions_for_handler = engine.versions.clone();
    let handler = Arc::new(move |_graph: &wharf_core::graph::ConfigGraph, changed: &ActionRef| {
        build_change_tasks(&graph_for_handler, &versions_for_handler, changed)
    });

    let project_root = engine.runtime.project_root.clone();
    let reloader = Arc::new(ReloadFromDisk { project_root });

    let watch_loop = watch::run(bus_rx, engine.graph.clone(), handler, reloader, task_tx, cancel.clone());
    tokio::pin!(watch_loop);

    loop {
        tokio::select! {
            outcome = &mut watch_loop => {
                let outcome: WatchOutcome = outcome;
                if outcome.restart_required {
                    tracing::info!("config changed, restarting dev session");
                }
                break;
            }
            tasks = task_rx.recv() => {
                let Some(tasks) = tasks else { break };
                let expander = GraphExpander::new(engine.graph.clone(), engine.versions.clone(), false);
                let results = run_to_completion(engine, tasks, expander, cancel.clone()).await;
                exit_code = report::summarize(&results);
            }
        }
    }

    syncs.shutdown_all().await;
    Ok(exit_code)
}

async fn start_sync_if_declared(syncs: &SyncRegistry, config: &ActionConfig) {
    let Some(sync) = config
        .spec
        .get("devMode")
        .and_then(|d| d.get("sync"))
        .and_then(|s| serde_json::from_value(s.clone()).ok())
    else {
        return;
    };
    if let Err(e) = syncs.ensure_running(config.action_ref.clone(), sync, "mutagen").await {
        tracing::warn!(action_ref = %config.action_ref, error = %e, "failed to start dev-mode sync");
    }
}

fn build_change_tasks(
    graph: &wharf_core::graph::ConfigGraph,
    versions: &std::collections::HashMap<ActionRef, String>,
    changed: &ActionRef,
) -> Vec<Task> {
    let mut affected = graph.get_dependants(changed, true);
    affected.insert(changed.clone());
    affected
        .into_iter()
        .filter_map(|action_ref| {
            let config = graph.get(&action_ref)?;
            if config.action_ref.kind != ActionKind::Deploy && config.action_ref.kind != ActionKind::Build {
                return None;
            }
            let kind = if config.action_ref.kind == ActionKind::Build {
                TaskKind::Build
            } else {
                TaskKind::Deploy
            };
            let version = versions.get(&action_ref).cloned().unwrap_or_else(|| "unversioned".into());
            Some(Task::new(kind, action_ref, version, false))
        })
        .collect()
}

struct ReloadFromDisk {
    project_root: std::path::PathBuf,
}

impl watch::ConfigReloader for ReloadFromDisk {
    fn reload(&self) -> wharf_core::error::Result<wharf_core::graph::ConfigGraph> {
        let loaded = wharf_core::config::load_directory(&self.project_root)?;
        wharf_core::graph::GraphBuilder::new(loaded.actions).build()
    }
}
