//! Action graph and task execution engine for container-based developer
//! workflows.
//!
//! A project declares a set of [`action`] configs (`Build`, `Deploy`,
//! `Run`, `Test`) whose specs may reference each other's outputs through
//! the [`template`] expression language. The [`graph`] module resolves
//! those references into an immutable [`graph::ConfigGraph`]; the
//! [`task`]/[`solver`] pair expands a requested set of actions into the
//! typed tasks that realize them and executes that task graph
//! concurrently via plugin [`plugin::Plugin`] handlers, short-circuiting
//! through the [`cache`] where possible. [`watch`] re-derives task sets
//! as project sources change.
//!
//! Grounded on the teacher's overall crate split
//! (`cloud-conveyor-core`/`-aws`/`-github`/`-cli`): one core library crate
//! with no knowledge of any specific provider, concrete provider crates
//! implementing its traits, and a thin CLI crate wiring a parser to it.
//! This crate is the core; `wharf-cli` is the thin binary.

#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod action;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod plugin;
pub mod solver;
pub mod task;
pub mod template;
pub mod watch;

pub use action::{ActionConfig, ActionKind, ActionRef, ResolvedAction};
pub use cache::ResultCache;
pub use context::LayeredContext;
pub use error::{EngineError, Result};
pub use executor::EngineExecutor;
pub use graph::{compute_versions, ConfigGraph, GraphBuilder};
pub use plugin::{HandlerContext, PluginRegistry, RuntimeContext};
pub use solver::{CancellationToken, ConcurrencyLimits, TaskGraphSolver};
pub use task::{GraphResults, Task, TaskKind, TaskOutcome, TaskStatus};

use std::sync::Arc;

/// The one mutable-at-the-edges object a command invocation constructs at
/// startup and destroys on exit (spec.md §9 Design Notes: "the original
/// keeps a process-wide event emitter and a cached handler-description
/// map. In the target design these are fields of a `Garden` session
/// object"). Tests may construct several independent sessions.
#[derive(Debug)]
pub struct Session {
    /// The resolved, immutable config graph for this invocation.
    pub graph: Arc<ConfigGraph>,
    /// The loaded plugin registry.
    pub registry: Arc<PluginRegistry>,
    /// The process-local result cache.
    pub cache: Arc<ResultCache>,
    /// Invocation-local values (CLI flags, project root, environment).
    pub runtime: Arc<RuntimeContext>,
    /// The cooperative cancellation token for this invocation.
    pub cancellation: CancellationToken,
}

impl Session {
    /// Builds a new session from its already-assembled parts. Construction
    /// of the graph and registry is left to callers (`wharf-cli`'s command
    /// layer), since it depends on the YAML loader and plugin discovery,
    /// neither of which this crate owns the on-disk format for.
    pub fn new(
        graph: ConfigGraph,
        registry: PluginRegistry,
        runtime: RuntimeContext,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            registry: Arc::new(registry),
            cache: Arc::new(ResultCache::new()),
            runtime: Arc::new(runtime),
            cancellation: CancellationToken::new(),
        }
    }
}
