//! Turns [`SolverEvent`]s into `tracing` output and a [`GraphResults`]
//! into the final summary line and process exit code (spec.md §7 "N
//! tasks failed", SPEC_FULL.md §6.1 exit codes).

use tracing::{error, info, warn};
use wharf_core::solver::SolverEvent;
use wharf_core::task::{GraphResults, TaskKind};

/// Logs one solver event at the level appropriate to its kind.
pub fn log_event(event: &SolverEvent) {
    match event {
        SolverEvent::TaskGraphProcessing => info!("task graph processing started"),
        SolverEvent::TaskComplete { key, outcome } => {
            if outcome.is_success() {
                info!(task = %key, status = ?outcome.status, "task complete");
            } else {
                warn!(task = %key, status = ?outcome.status, "task complete with non-ready status");
            }
        }
        SolverEvent::TaskError { key, error } => {
            error!(task = %key, %error, "task failed");
        }
        SolverEvent::DeployStatusUpdate { action_ref, status } => {
            info!(%action_ref, ?status, "deploy status update");
        }
        SolverEvent::BuildLogChunk { action_ref, chunk } => {
            for line in chunk.lines() {
                info!(%action_ref, "{line}");
            }
        }
        SolverEvent::TaskGraphComplete { results } => {
            info!(count = results.len(), "task graph complete");
        }
    }
}

const TERMINAL_KINDS: [TaskKind; 4] = [TaskKind::Build, TaskKind::Deploy, TaskKind::Run, TaskKind::Test];

fn is_terminal_key(key: &str) -> bool {
    TERMINAL_KINDS
        .iter()
        .any(|kind| key.starts_with(&format!("{kind}:")))
}

/// Counts terminal tasks (the kinds a human schedules, not their
/// `GetXStatus`/`GetXResult` prerequisites) that failed, prints the
/// summary line, and returns the process exit code.
pub fn summarize(results: &GraphResults) -> i32 {
    let mut failed = 0usize;
    let mut total = 0usize;
    for (key, outcome) in results {
        if !is_terminal_key(key) {
            continue;
        }
        total += 1;
        if !outcome.as_ref().map(|o| o.is_success()).unwrap_or(false) {
            failed += 1;
        }
    }
    if failed > 0 {
        error!(failed, total, "{failed} of {total} tasks failed");
        println!("{failed} task(s) failed");
        1
    } else {
        println!("all {total} task(s) completed successfully");
        0
    }
}

/// True if any task of `kind` in `results` failed; used by commands that
/// need a pass/fail verdict for one action kind specifically (e.g. `test`
/// exits non-zero only on a `Test` failure, not on a prerequisite
/// `Build`/`Deploy` failure being merely logged).
pub fn any_failed(results: &GraphResults, kind: TaskKind) -> bool {
    results
        .iter()
        .filter(|(key, _)| key.starts_with(&format!("{kind}:")))
        .any(|(_, outcome)| outcome.as_ref().map(|o| !o.is_success()).unwrap_or(true))
}
