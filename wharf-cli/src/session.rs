//! Assembles a [`wharf_core::Session`] from on-disk project state: loads
//! the YAML tree, builds the [`wharf_core::ConfigGraph`], seals the
//! layered context, registers plugins, and computes every action's
//! content-hash version up front (spec.md §3 "Context layers are sealed in
//! dependency order at graph-build time").
//!
//! Grounded on the teacher's `load_app_from_yaml` (`cloud-conveyor-core::
//! yaml`) as the "one function that turns a project directory into
//! something runnable" entry point, generalized across the four action
//! kinds and the plugin registry the teacher's single hard-coded provider
//! never needed.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use wharf_core::action::ActionRef;
use wharf_core::context::LayeredContext;
use wharf_core::graph::GraphBuilder;
use wharf_core::plugin::{exec::ExecPlugin, PluginRegistry, RuntimeContext};
use wharf_core::{cache::ResultCache, compute_versions, ConfigGraph};

use crate::settings::Settings;

/// Everything a command needs to schedule and run tasks: the built graph,
/// the per-action versions computed against the sealed context, the
/// plugin registry, the result cache, and the runtime context handlers
/// receive.
pub struct Engine {
    /// The immutable, resolved config graph.
    pub graph: Arc<ConfigGraph>,
    /// Every action's content-hash version, computed once up front.
    pub versions: HashMap<ActionRef, String>,
    /// The shared layered context (used by the executor to resolve specs
    /// per task and to seal action outputs as they complete).
    pub context: Arc<LayeredContext>,
    /// The loaded plugin registry (currently just `exec`; see DESIGN.md).
    pub registry: Arc<PluginRegistry>,
    /// The process-local result cache.
    pub cache: Arc<ResultCache>,
    /// Invocation-local runtime values.
    pub runtime: Arc<RuntimeContext>,
    /// The project's declared name, threaded through to handlers.
    pub project_name: String,
}

impl Engine {
    /// Loads `settings.project_root`, builds the config graph, and seals
    /// every context layer the Graph Builder itself doesn't own (project,
    /// environment, providers, runtime). Fails with a `ConfigurationError`-
    /// flavored message if the directory doesn't parse or the named
    /// environment doesn't exist.
    pub fn assemble(settings: &Settings) -> Result<Self> {
        let loaded = wharf_core::config::load_directory(&settings.project_root)
            .with_context(|| format!("loading project at {}", settings.project_root.display()))?;

        let project_name = loaded
            .project
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "unnamed".to_string());
        let project_variables = loaded
            .project
            .as_ref()
            .map(|p| Value::Object(p.variables.clone()))
            .unwrap_or_else(|| json!({}));

        let environment = loaded.environments.get(&settings.environment);
        if environment.is_none() && !loaded.environments.is_empty() {
            bail!(
                "environment '{}' is not declared by this project",
                settings.environment
            );
        }
        let environment_value = environment
            .map(|e| {
                let mut merged = e.variables.clone();
                if !e.secrets.is_empty() {
                    merged.insert("secrets".into(), Value::Object(e.secrets.clone()));
                }
                Value::Object(merged)
            })
            .unwrap_or_else(|| json!({}));

        let graph = GraphBuilder::new(loaded.actions)
            .build()
            .context("building the config graph")?;

        let mut context = LayeredContext::new();
        context.project = wharf_core::context::StaticLayer::new(json!({
            "name": project_name,
            "variables": project_variables,
        }));
        context.environment = wharf_core::context::StaticLayer::new(environment_value);
        context.runtime = wharf_core::context::StaticLayer::new(json!({
            "environment": settings.environment,
            "force": settings.force,
            "projectRoot": settings.project_root.to_string_lossy(),
        }));
        for (name, provider) in &loaded.providers {
            context.providers.seal(name.clone(), provider.config.clone());
        }
        let context = Arc::new(context);

        let versions = compute_versions(&graph, context.as_ref())
            .context("computing task versions")?;

        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(ExecPlugin));

        let runtime = Arc::new(RuntimeContext {
            project_root: settings.project_root.clone(),
            working_dir: settings.working_dir.clone(),
            environment: settings.environment.clone(),
            force: settings.force,
            assume_yes: settings.assume_yes,
        });

        Ok(Self {
            graph: Arc::new(graph),
            versions,
            context,
            registry: Arc::new(registry),
            cache: Arc::new(ResultCache::new()),
            runtime,
            project_name,
        })
    }

    /// Re-loads the project from disk and rebuilds every derived piece of
    /// state, for the watch loop's config-change restart path (spec.md
    /// §4.8 step 2). The result cache and sync registry are intentionally
    /// *not* reset here — only the graph, context, and versions are
    /// rebuilt — so a restart doesn't throw away work a dev session has
    /// already cached.
    pub fn reload(&self, settings: &Settings) -> Result<ConfigGraph> {
        let loaded = wharf_core::config::load_directory(&settings.project_root)?;
        GraphBuilder::new(loaded.actions)
            .build()
            .map_err(anyhow::Error::from)
    }
}
