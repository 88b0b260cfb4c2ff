//! The Task Graph / Solver (spec.md §4.6/§5): the concurrent executor that
//! expands an initial task list into its prerequisite closure, deduplicates
//! by key, schedules under per-task-type concurrency limits, and streams
//! lifecycle events while producing a [`GraphResults`] map.
//!
//! Grounded on the teacher's `StateMachine::tick_machine_state`
//! (`cloud-conveyor-core::state_machine`) for the overall shape — poll one
//! action, react to its result, feed new work back in — but that teacher
//! code is single-threaded and serial by construction (one `Pipeline`, one
//! `current_action`). This module is the structured-concurrency
//! replacement spec.md §9 calls for explicitly ("Coroutine control flow in
//! the original. Replace with a structured task abstraction..."): `tokio`
//! owns the concurrency, a single-writer event loop owns the dependency
//! bookkeeping, and workers are ordinary `async fn`s gated by a
//! `tokio::sync::Semaphore` per task-type, matching §5's "workers submit
//! results via a bounded channel" requirement.

use crate::action::ActionRef;
use crate::error::{EngineError, Result};
use crate::task::{GraphResults, Task, TaskKind, TaskOutcome, TaskStatus};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// A shared, cooperative cancellation signal (spec.md §5 "Cancellation").
/// Checked at every suspension point; irreversible within a pass.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    /// Creates a fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers cancellation. Irreversible.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// True once [`CancellationToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled; a no-op future if already
    /// cancelled when polled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Per-task-type concurrency caps (spec.md §4.6 `concurrencyLimit`, §5
/// "per-task-type limits ... cap downstream strain"). Falls back to a
/// single default (CPU count, typically) for kinds without an override.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimits {
    default_limit: usize,
    overrides: HashMap<TaskKind, usize>,
}

impl ConcurrencyLimits {
    /// Builds limits with `default_limit` applied to every task kind
    /// without an explicit override.
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit: default_limit.max(1),
            overrides: HashMap::new(),
        }
    }

    /// Limits `default_limit` to the host's available parallelism.
    pub fn host_default() -> Self {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(n)
    }

    /// Overrides the concurrency limit for one task kind (e.g.
    /// `delete-service` ≤ 10, spec.md §5).
    pub fn with_limit(mut self, kind: TaskKind, limit: usize) -> Self {
        self.overrides.insert(kind, limit.max(1));
        self
    }

    fn limit_for(&self, kind: TaskKind) -> usize {
        self.overrides.get(&kind).copied().unwrap_or(self.default_limit)
    }
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self::host_default()
    }
}

/// A unit-of-work executor: a pure-ish async function from `(task, its
/// dependencies' outcomes)` to an outcome. Implementations own whatever
/// plugin dispatch, cache short-circuiting, and force-flag handling their
/// task kind needs; the solver only needs the result (spec.md §9 "handlers
/// remain ordinary procedures that may await I/O").
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Runs `task` given the already-terminal outcomes of its declared
    /// dependencies. `cancel` should be checked at I/O suspension points
    /// and propagated to any subprocess/plugin call made.
    async fn execute(
        &self,
        task: &Task,
        deps: &GraphResults,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome>;
}

/// Expands a task into its declared prerequisite tasks (spec.md §4.5's
/// per-kind table), without recursing — the solver calls this repeatedly
/// to build the full closure.
pub trait TaskExpander: Send + Sync {
    /// Returns the direct prerequisites of `task`.
    fn expand(&self, task: &Task) -> Vec<Task>;
}

impl<F> TaskExpander for F
where
    F: Fn(&Task) -> Vec<Task> + Send + Sync,
{
    fn expand(&self, task: &Task) -> Vec<Task> {
        self(task)
    }
}

/// Lifecycle events streamed while the solver runs (spec.md §4.6 "Events").
#[derive(Clone, Debug)]
pub enum SolverEvent {
    /// Emitted once, before any task starts.
    TaskGraphProcessing,
    /// A task finished without error.
    TaskComplete {
        /// The task's dedup key.
        key: String,
        /// Its outcome.
        outcome: TaskOutcome,
    },
    /// A task finished with an error (its descendants are aborted).
    TaskError {
        /// The task's dedup key.
        key: String,
        /// The error message.
        error: String,
    },
    /// A deploy-kind task produced a fresh status.
    DeployStatusUpdate {
        /// The action the status is for.
        action_ref: ActionRef,
        /// The status reported.
        status: TaskStatus,
    },
    /// A build-kind task produced a chunk of log output.
    BuildLogChunk {
        /// The action the log belongs to.
        action_ref: ActionRef,
        /// The chunk of log text.
        chunk: String,
    },
    /// Emitted once the pool is idle and every task has a terminal result.
    TaskGraphComplete {
        /// The final results map.
        results: GraphResults,
    },
}

struct ClosureNode {
    task: Task,
    remaining_deps: usize,
    dependents: Vec<String>,
}

/// The concurrent task-graph executor (spec.md §4.6).
pub struct TaskGraphSolver {
    concurrency: ConcurrencyLimits,
}

impl TaskGraphSolver {
    /// Builds a solver with the given per-kind concurrency caps.
    pub fn new(concurrency: ConcurrencyLimits) -> Self {
        Self { concurrency }
    }

    /// Computes the prerequisite closure over `initial`, deduplicating by
    /// task key (spec.md §4.6 "Deduplication"): if two initial tasks (or a
    /// task and a prerequisite discovered later) share a key, only one
    /// node is created and every edge into it is preserved.
    fn build_closure(&self, initial: Vec<Task>, expander: &dyn TaskExpander) -> HashMap<String, ClosureNode> {
        let mut nodes: HashMap<String, ClosureNode> = HashMap::new();
        let mut queue: VecDeque<Task> = initial.into();

        while let Some(task) = queue.pop_front() {
            if nodes.contains_key(&task.key) {
                continue;
            }
            let prereqs = expander.expand(&task);
            let dep_keys: Vec<String> = prereqs.iter().map(|t| t.key.clone()).collect();
            let mut task = task;
            task.deps = dep_keys.clone();
            nodes.insert(
                task.key.clone(),
                ClosureNode {
                    task,
                    remaining_deps: dep_keys.len(),
                    dependents: Vec::new(),
                },
            );
            for prereq in prereqs {
                queue.push_back(prereq);
            }
        }

        // Second pass: wire up the reverse (dependents) edges now that
        // every node exists, and recompute remaining_deps against nodes
        // that actually exist (a prerequisite that itself had zero
        // prerequisites and was already inserted still needs the edge).
        let keys: Vec<String> = nodes.keys().cloned().collect();
        for key in &keys {
            let dep_keys = nodes[key].task.deps.clone();
            for dep_key in dep_keys {
                if let Some(dep_node) = nodes.get_mut(&dep_key) {
                    dep_node.dependents.push(key.clone());
                }
            }
        }
        nodes
    }

    /// Runs the solver to completion: expands `initial`'s closure, executes
    /// every task respecting dependency order and concurrency caps, and
    /// returns the final [`GraphResults`]. Events are sent to `events` as
    /// they occur; the receiver may be dropped if the caller doesn't care.
    pub async fn solve(
        &self,
        initial: Vec<Task>,
        expander: Arc<dyn TaskExpander>,
        executor: Arc<dyn TaskExecutor>,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<SolverEvent>,
    ) -> GraphResults {
        let _ = events.send(SolverEvent::TaskGraphProcessing);

        let mut nodes = self.build_closure(initial, expander.as_ref());
        let mut results: GraphResults = HashMap::new();
        let mut outstanding: HashSet<String> = nodes.keys().cloned().collect();
        let mut running: usize = 0;
        // Keys currently executing in a spawned worker: excluded from the
        // cancellation pre-abort sweep so a task that already started
        // always reports back through the channel instead of being
        // double-resolved.
        let mut dispatched: HashSet<String> = HashSet::new();

        let semaphores: HashMap<TaskKind, Arc<Semaphore>> = {
            let mut kinds: HashSet<TaskKind> = HashSet::new();
            for node in nodes.values() {
                kinds.insert(node.task.kind);
            }
            kinds
                .into_iter()
                .map(|k| (k, Arc::new(Semaphore::new(self.concurrency.limit_for(k)))))
                .collect()
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<(String, std::result::Result<TaskOutcome, EngineError>)>();

        // Seed the ready queue: every node with zero remaining deps.
        let mut ready: VecDeque<String> = nodes
            .iter()
            .filter(|(_, n)| n.remaining_deps == 0)
            .map(|(k, _)| k.clone())
            .collect();

        // Tasks aborted before ever running (cycle-free by construction,
        // but a dependency may itself be aborted/erroring) collect here so
        // we can cascade without re-entrant borrow issues.
        let mut to_abort: VecDeque<String> = VecDeque::new();

        loop {
            if cancel.is_cancelled() {
                // Abort everything not already terminal and not currently
                // dispatched; dispatched tasks finish but their results are
                // discarded when they report back (spec.md §5).
                ready.clear();
                let pending: Vec<String> = outstanding
                    .iter()
                    .filter(|k| !dispatched.contains(*k))
                    .cloned()
                    .collect();
                for key in pending {
                    results.insert(key.clone(), None);
                    outstanding.remove(&key);
                }
                if outstanding.is_empty() {
                    break;
                }
            }

            while let Some(key) = ready.pop_front() {
                if cancel.is_cancelled() {
                    results.insert(key.clone(), None);
                    outstanding.remove(&key);
                    continue;
                }
                let task = nodes[&key].task.clone();
                let dep_results: GraphResults = task
                    .deps
                    .iter()
                    .map(|d| (d.clone(), results.get(d).cloned().flatten()))
                    .collect();
                let semaphore = Arc::clone(&semaphores[&task.kind]);
                let executor = Arc::clone(&executor);
                let cancel_clone = cancel.clone();
                let tx = tx.clone();
                running += 1;
                dispatched.insert(key.clone());
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let outcome = executor.execute(&task, &dep_results, &cancel_clone).await;
                    let _ = tx.send((task.key.clone(), outcome));
                });
            }

            while let Some(key) = to_abort.pop_front() {
                if results.contains_key(&key) {
                    continue;
                }
                results.insert(key.clone(), None);
                outstanding.remove(&key);
                if let Some(node) = nodes.get(&key) {
                    for dependent in node.dependents.clone() {
                        to_abort.push_back(dependent);
                    }
                }
            }

            if outstanding.is_empty() {
                break;
            }
            if running == 0 && ready.is_empty() && to_abort.is_empty() {
                // No progress possible: every remaining node is blocked on
                // something that will never resolve. This should not
                // happen for a graph this crate built itself; treat it as
                // an internal invariant violation rather than spinning.
                warn!("solver stalled with outstanding tasks and nothing running");
                for key in outstanding.drain() {
                    results.entry(key).or_insert(None);
                }
                break;
            }

            let Some((key, outcome)) = rx.recv().await else {
                break;
            };
            running -= 1;
            dispatched.remove(&key);

            if cancel.is_cancelled() {
                debug!(%key, "discarding result of task that finished after cancellation");
                results.insert(key.clone(), None);
                outstanding.remove(&key);
                continue;
            }

            match outcome {
                Ok(outcome) if outcome.is_success() => {
                    maybe_emit_granular_event(&nodes, &key, &outcome, &events);
                    let _ = events.send(SolverEvent::TaskComplete {
                        key: key.clone(),
                        outcome: outcome.clone(),
                    });
                    info!(%key, status = ?outcome.status, "task complete");
                    results.insert(key.clone(), Some(outcome));
                    outstanding.remove(&key);
                    release_dependents(&key, &mut nodes, &results, &mut ready, &mut to_abort);
                }
                Ok(outcome) => {
                    let message = outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("task reported status {:?}", outcome.status));
                    error!(%key, %message, "task failed");
                    let _ = events.send(SolverEvent::TaskError {
                        key: key.clone(),
                        error: message,
                    });
                    results.insert(key.clone(), Some(outcome));
                    outstanding.remove(&key);
                    if let Some(node) = nodes.get(&key) {
                        for dependent in node.dependents.clone() {
                            to_abort.push_back(dependent);
                        }
                    }
                }
                Err(e) => {
                    error!(%key, error = %e, "task executor errored");
                    let _ = events.send(SolverEvent::TaskError {
                        key: key.clone(),
                        error: e.to_string(),
                    });
                    results.insert(key.clone(), None);
                    outstanding.remove(&key);
                    if let Some(node) = nodes.get(&key) {
                        for dependent in node.dependents.clone() {
                            to_abort.push_back(dependent);
                        }
                    }
                }
            }
        }

        let _ = events.send(SolverEvent::TaskGraphComplete {
            results: results.clone(),
        });
        results
    }
}

fn release_dependents(
    finished_key: &str,
    nodes: &mut HashMap<String, ClosureNode>,
    results: &GraphResults,
    ready: &mut VecDeque<String>,
    to_abort: &mut VecDeque<String>,
) {
    let Some(node) = nodes.get(finished_key) else {
        return;
    };
    let dependents = node.dependents.clone();
    for dependent_key in dependents {
        let Some(dependent) = nodes.get_mut(&dependent_key) else {
            continue;
        };
        if dependent.remaining_deps == 0 {
            continue; // already released
        }
        dependent.remaining_deps -= 1;
        if dependent.remaining_deps == 0 {
            let all_deps_ok = dependent.task.deps.iter().all(|d| {
                results
                    .get(d)
                    .map(|r| r.as_ref().is_some_and(|o| o.is_success()))
                    .unwrap_or(false)
            });
            if all_deps_ok {
                ready.push_back(dependent_key);
            } else {
                to_abort.push_back(dependent_key);
            }
        }
    }
}

fn maybe_emit_granular_event(
    nodes: &HashMap<String, ClosureNode>,
    key: &str,
    outcome: &TaskOutcome,
    events: &mpsc::UnboundedSender<SolverEvent>,
) {
    let Some(node) = nodes.get(key) else {
        return;
    };
    match node.task.kind {
        TaskKind::Build => {
            let _ = events.send(SolverEvent::BuildLogChunk {
                action_ref: node.task.action_ref.clone(),
                chunk: outcome.log.clone(),
            });
        }
        TaskKind::DeployStatus => {
            let _ = events.send(SolverEvent::DeployStatusUpdate {
                action_ref: node.task.action_ref.clone(),
                status: outcome.status,
            });
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;
    use std::time::SystemTime;

    fn outcome(key: &str, status: TaskStatus, error: Option<&str>) -> TaskOutcome {
        TaskOutcome {
            task_key: key.into(),
            status,
            output: Value::Null,
            log: String::new(),
            started_at: SystemTime::now(),
            completed_at: SystemTime::now(),
            error: error.map(|s| s.to_string()),
        }
    }

    struct RecordingExecutor {
        invocations: StdMutex<Vec<String>>,
        fail: HashSet<String>,
    }

    #[async_trait]
    impl TaskExecutor for RecordingExecutor {
        async fn execute(
            &self,
            task: &Task,
            _deps: &GraphResults,
            _cancel: &CancellationToken,
        ) -> Result<TaskOutcome> {
            self.invocations.lock().unwrap().push(task.key.clone());
            if self.fail.contains(&task.key) {
                Ok(outcome(&task.key, TaskStatus::Error, Some("boom")))
            } else {
                Ok(outcome(&task.key, TaskStatus::Ready, None))
            }
        }
    }

    fn simple_task(kind: TaskKind, name: &str, deps: Vec<String>) -> Task {
        let mut t = Task::new(kind, ActionRef::new(ActionKind::Build, name), "v1".into(), false);
        t.deps = deps;
        t
    }

    struct StaticExpander {
        table: HashMap<String, Vec<Task>>,
    }

    impl TaskExpander for StaticExpander {
        fn expand(&self, task: &Task) -> Vec<Task> {
            self.table.get(&task.key).cloned().unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn no_task_executes_before_its_prerequisites_terminate() {
        let dep = simple_task(TaskKind::BuildStatus, "api", vec![]);
        let main = simple_task(TaskKind::Build, "api", vec![dep.key.clone()]);
        let mut table = HashMap::new();
        table.insert(main.key.clone(), vec![dep.clone()]);
        let expander = Arc::new(StaticExpander { table });

        let executor = Arc::new(RecordingExecutor {
            invocations: StdMutex::new(Vec::new()),
            fail: HashSet::new(),
        });
        let solver = TaskGraphSolver::new(ConcurrencyLimits::new(4));
        let (tx, _rx) = mpsc::unbounded_channel();
        let results = solver
            .solve(vec![main.clone()], expander, executor.clone(), CancellationToken::new(), tx)
            .await;

        let order = executor.invocations.lock().unwrap().clone();
        let dep_pos = order.iter().position(|k| k == &dep.key).unwrap();
        let main_pos = order.iter().position(|k| k == &main.key).unwrap();
        assert!(dep_pos < main_pos);
        assert!(results.get(&main.key).unwrap().as_ref().unwrap().is_success());
    }

    #[tokio::test]
    async fn dedup_invokes_handler_once_for_shared_key() {
        let shared = simple_task(TaskKind::BuildStatus, "api", vec![]);
        let a = simple_task(TaskKind::Build, "a", vec![shared.key.clone()]);
        let b = simple_task(TaskKind::Deploy, "b", vec![shared.key.clone()]);
        let mut table = HashMap::new();
        table.insert(a.key.clone(), vec![shared.clone()]);
        table.insert(b.key.clone(), vec![shared.clone()]);
        let expander = Arc::new(StaticExpander { table });

        let executor = Arc::new(RecordingExecutor {
            invocations: StdMutex::new(Vec::new()),
            fail: HashSet::new(),
        });
        let solver = TaskGraphSolver::new(ConcurrencyLimits::new(4));
        let (tx, _rx) = mpsc::unbounded_channel();
        let _ = solver
            .solve(vec![a, b], expander, executor.clone(), CancellationToken::new(), tx)
            .await;

        let count = executor
            .invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|k| *k == &shared.key)
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn failure_is_isolated_to_dependent_branch() {
        let f = simple_task(TaskKind::Build, "f", vec![]);
        let g = simple_task(TaskKind::Build, "g", vec![]);
        let expander = Arc::new(StaticExpander {
            table: HashMap::new(),
        });
        let mut fail = HashSet::new();
        fail.insert(f.key.clone());
        let executor = Arc::new(RecordingExecutor {
            invocations: StdMutex::new(Vec::new()),
            fail,
        });
        let solver = TaskGraphSolver::new(ConcurrencyLimits::new(4));
        let (tx, _rx) = mpsc::unbounded_channel();
        let results = solver
            .solve(vec![f.clone(), g.clone()], expander, executor, CancellationToken::new(), tx)
            .await;

        assert!(!results.get(&f.key).unwrap().as_ref().unwrap().is_success());
        assert!(results.get(&g.key).unwrap().as_ref().unwrap().is_success());
    }

    #[tokio::test]
    async fn descendant_of_failed_task_is_aborted() {
        let f = simple_task(TaskKind::Build, "f", vec![]);
        let dependent = simple_task(TaskKind::Deploy, "dependent", vec![f.key.clone()]);
        let mut table = HashMap::new();
        table.insert(dependent.key.clone(), vec![f.clone()]);
        let expander = Arc::new(StaticExpander { table });
        let mut fail = HashSet::new();
        fail.insert(f.key.clone());
        let executor = Arc::new(RecordingExecutor {
            invocations: StdMutex::new(Vec::new()),
            fail,
        });
        let solver = TaskGraphSolver::new(ConcurrencyLimits::new(4));
        let (tx, _rx) = mpsc::unbounded_channel();
        let results = solver
            .solve(vec![dependent.clone()], expander, executor, CancellationToken::new(), tx)
            .await;

        assert!(results.get(&dependent.key).unwrap().is_none());
    }
}
