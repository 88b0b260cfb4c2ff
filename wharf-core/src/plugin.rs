//! Plugin Registry & Handler Router (spec.md §4.4/§6) plus the one
//! concrete, in-tree plugin (`exec`) needed to exercise the engine
//! end-to-end without mocking every handler.
//!
//! Grounded on the teacher's `BuildSource`/`DeployInfrastructure`
//! `#[async_trait]` traits (`cloud-conveyor-core::build`/`deploy`), which
//! already model "a provider-agnostic trait a plugin implements, invoked
//! with a bundled context struct". This module generalizes that one-trait-
//! per-kind pattern to four kinds, adds the *base*-chain override lookup
//! the teacher never needed (cloud-conveyor has exactly one active
//! provider per kind), and the teacher's hard failure-crate error type is
//! replaced with this crate's own `EngineError`, consistent with the rest
//! of the workspace.

use crate::action::ResolvedAction;
use crate::error::{EngineError, Result};
use crate::graph::ConfigGraph;
use crate::task::TaskOutcome;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Span;

/// Bundle passed to every handler invocation (spec.md §6.3).
pub struct HandlerContext<'a> {
    /// A span already carrying the action ref and handler name, so a
    /// handler's own `tracing` calls nest under it.
    pub log: Span,
    /// Provider-specific config for this action's provider, passed through
    /// opaquely (TLS refs, namespace selectors, resource limits, etc).
    pub provider_config: Value,
    /// The project's name, for handlers that need it in generated resource
    /// names.
    pub project_name: String,
    /// The action being operated on, fully resolved.
    pub action: ResolvedAction,
    /// Read-only access to the whole config graph (for handlers that need
    /// to inspect a dependency's spec directly, e.g. to wire a service
    /// name).
    pub graph: Arc<ConfigGraph>,
    /// Runtime-local values: CLI flags, invocation id, working directory.
    pub runtime: Arc<RuntimeContext>,
}

/// `RuntimeContext` (spec.md §3): invocation-local values sealed once at
/// command start.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    /// The project root directory.
    pub project_root: std::path::PathBuf,
    /// The `.garden`-equivalent working/state directory.
    pub working_dir: std::path::PathBuf,
    /// The active environment name (`--env`).
    pub environment: String,
    /// Whether `--force` was passed.
    pub force: bool,
    /// Whether `--yes` was passed (skip interactive confirmations).
    pub assume_yes: bool,
}

/// Build-kind handlers (spec.md §4.4): `build`, `getStatus` required;
/// `publish`, `run` optional.
#[async_trait]
pub trait BuildHandler: Send + Sync + std::fmt::Debug {
    /// Produces the build artifact.
    async fn build(&self, ctx: &HandlerContext<'_>) -> Result<TaskOutcome>;
    /// Checks whether the artifact is present and current.
    async fn get_status(&self, ctx: &HandlerContext<'_>) -> Result<TaskOutcome>;
    /// Publishes a previously-built artifact to a registry. Optional.
    async fn publish(&self, _ctx: &HandlerContext<'_>) -> Result<Option<TaskOutcome>> {
        Ok(None)
    }
    /// Runs an ad-hoc command inside the build's environment. Optional.
    async fn run(&self, _ctx: &HandlerContext<'_>) -> Result<Option<TaskOutcome>> {
        Ok(None)
    }
}

/// Deploy-kind handlers (spec.md §4.4): `deploy`, `getStatus` required;
/// the rest optional.
#[async_trait]
pub trait DeployHandler: Send + Sync + std::fmt::Debug {
    /// Creates or updates the deployment.
    async fn deploy(&self, ctx: &HandlerContext<'_>) -> Result<TaskOutcome>;
    /// Checks whether the deployment is present, healthy, and current.
    async fn get_status(&self, ctx: &HandlerContext<'_>) -> Result<TaskOutcome>;
    /// Tears the deployment down. Optional.
    async fn delete(&self, _ctx: &HandlerContext<'_>) -> Result<Option<TaskOutcome>> {
        Ok(None)
    }
    /// Execs a command inside the running deployment. Optional.
    async fn exec(&self, _ctx: &HandlerContext<'_>, _command: &[String]) -> Result<Option<String>> {
        Ok(None)
    }
    /// Streams logs from the running deployment. Optional.
    async fn get_logs(&self, _ctx: &HandlerContext<'_>) -> Result<Option<String>> {
        Ok(None)
    }
    /// Opens a port-forward to the deployment. Optional.
    async fn get_port_forward(&self, _ctx: &HandlerContext<'_>) -> Result<Option<u16>> {
        Ok(None)
    }
    /// Closes a previously-opened port-forward. Optional.
    async fn stop_port_forward(&self, _ctx: &HandlerContext<'_>) -> Result<()> {
        Ok(())
    }
    /// Runs an ad-hoc command as part of the deploy flow. Optional.
    async fn run(&self, _ctx: &HandlerContext<'_>) -> Result<Option<TaskOutcome>> {
        Ok(None)
    }
}

/// Run-kind handlers (spec.md §4.4): both required.
#[async_trait]
pub trait RunHandler: Send + Sync + std::fmt::Debug {
    /// Executes the one-off process.
    async fn run(&self, ctx: &HandlerContext<'_>) -> Result<TaskOutcome>;
    /// Looks up a cached result for this run, if one exists.
    async fn get_result(&self, ctx: &HandlerContext<'_>) -> Result<Option<TaskOutcome>>;
}

/// Test-kind handlers (spec.md §4.4): both required.
#[async_trait]
pub trait TestHandler: Send + Sync + std::fmt::Debug {
    /// Executes the test suite.
    async fn run(&self, ctx: &HandlerContext<'_>) -> Result<TaskOutcome>;
    /// Looks up a cached result for this test run, if one exists.
    async fn get_result(&self, ctx: &HandlerContext<'_>) -> Result<Option<TaskOutcome>>;
}

/// A plugin: a named bundle of handlers for one or more action types, with
/// an optional *base* plugin it overrides (spec.md §4.4/§9).
pub trait Plugin: Send + Sync + std::fmt::Debug {
    /// The plugin's unique name.
    fn name(&self) -> &str;
    /// The name of the plugin this one overrides, if any.
    fn base(&self) -> Option<&str> {
        None
    }
    /// Action-type tags this plugin provides handlers for.
    fn action_types(&self) -> &[&str];
    /// The `Build` handler for `action_type`, if this plugin provides one.
    fn build_handler(&self, _action_type: &str) -> Option<Arc<dyn BuildHandler>> {
        None
    }
    /// The `Deploy` handler for `action_type`, if this plugin provides one.
    fn deploy_handler(&self, _action_type: &str) -> Option<Arc<dyn DeployHandler>> {
        None
    }
    /// The `Run` handler for `action_type`, if this plugin provides one.
    fn run_handler(&self, _action_type: &str) -> Option<Arc<dyn RunHandler>> {
        None
    }
    /// The `Test` handler for `action_type`, if this plugin provides one.
    fn test_handler(&self, _action_type: &str) -> Option<Arc<dyn TestHandler>> {
        None
    }
}

/// A resolved handler plus the `base` implementation it overrides, if any
/// (spec.md §4.4 "a base reference to the overridden implementation").
pub struct Resolved<T: ?Sized> {
    /// The most-derived handler for this `(action_type, handler)`.
    pub handler: Arc<T>,
    /// The next handler down the base chain, if the most-derived one wants
    /// to delegate to it.
    pub base: Option<Arc<T>>,
}

/// Loads plugins and resolves `(action_type, handler)` lookups through the
/// plugin *base* chain (spec.md §4.4).
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    action_type_owner: HashMap<String, String>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin. Later registrations for the same `action_type`
    /// become the owner (allows a project to load a replacement plugin
    /// after its defaults).
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        for action_type in plugin.action_types() {
            self.action_type_owner
                .insert((*action_type).to_string(), plugin.name().to_string());
        }
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    fn base_chain(&self, action_type: &str) -> Vec<Arc<dyn Plugin>> {
        let mut chain = Vec::new();
        let mut current = self.action_type_owner.get(action_type).cloned();
        let mut guard = 0;
        while let Some(name) = current {
            guard += 1;
            if guard > self.plugins.len() + 1 {
                break; // defend against a misconfigured base cycle
            }
            let Some(plugin) = self.plugins.get(&name) else {
                break;
            };
            chain.push(Arc::clone(plugin));
            current = plugin.base().map(|s| s.to_string());
        }
        chain
    }

    fn resolve<T: ?Sized>(
        &self,
        action_type: &str,
        get: impl Fn(&dyn Plugin, &str) -> Option<Arc<T>>,
    ) -> Option<Resolved<T>> {
        let mut found: Vec<Arc<T>> = Vec::new();
        for plugin in self.base_chain(action_type) {
            if let Some(h) = get(plugin.as_ref(), action_type) {
                found.push(h);
            }
        }
        if found.is_empty() {
            return None;
        }
        let handler = found.remove(0);
        let base = if found.is_empty() { None } else { Some(found.remove(0)) };
        Some(Resolved { handler, base })
    }

    /// Resolves the `Build` handler for `action_type`.
    pub fn build_handler(&self, action_type: &str) -> Result<Resolved<dyn BuildHandler>> {
        self.resolve(action_type, |p, t| p.build_handler(t))
            .ok_or_else(|| not_implemented(action_type, "build"))
    }

    /// Resolves the `Deploy` handler for `action_type`.
    pub fn deploy_handler(&self, action_type: &str) -> Result<Resolved<dyn DeployHandler>> {
        self.resolve(action_type, |p, t| p.deploy_handler(t))
            .ok_or_else(|| not_implemented(action_type, "deploy"))
    }

    /// Resolves the `Run` handler for `action_type`.
    pub fn run_handler(&self, action_type: &str) -> Result<Resolved<dyn RunHandler>> {
        self.resolve(action_type, |p, t| p.run_handler(t))
            .ok_or_else(|| not_implemented(action_type, "run"))
    }

    /// Resolves the `Test` handler for `action_type`.
    pub fn test_handler(&self, action_type: &str) -> Result<Resolved<dyn TestHandler>> {
        self.resolve(action_type, |p, t| p.test_handler(t))
            .ok_or_else(|| not_implemented(action_type, "test"))
    }
}

fn not_implemented(action_type: &str, handler: &str) -> EngineError {
    EngineError::Plugin {
        handler: handler.into(),
        action: crate::action::ActionRef::new(crate::action::ActionKind::Build, action_type),
        message: format!("no plugin implements '{handler}' for action type '{action_type}'"),
    }
}

pub mod exec;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct BasePlugin;
    #[derive(Debug)]
    struct OverridePlugin;

    #[async_trait]
    impl BuildHandler for BasePlugin {
        async fn build(&self, _ctx: &HandlerContext<'_>) -> Result<TaskOutcome> {
            unimplemented!()
        }
        async fn get_status(&self, _ctx: &HandlerContext<'_>) -> Result<TaskOutcome> {
            unimplemented!()
        }
    }

    impl Plugin for BasePlugin {
        fn name(&self) -> &str {
            "base"
        }
        fn action_types(&self) -> &[&str] {
            &["container"]
        }
        fn build_handler(&self, _action_type: &str) -> Option<Arc<dyn BuildHandler>> {
            Some(Arc::new(BasePlugin))
        }
    }

    impl Plugin for OverridePlugin {
        fn name(&self) -> &str {
            "override"
        }
        fn base(&self) -> Option<&str> {
            Some("base")
        }
        fn action_types(&self) -> &[&str] {
            &["container"]
        }
        fn build_handler(&self, _action_type: &str) -> Option<Arc<dyn BuildHandler>> {
            None // delegates entirely to base
        }
    }

    #[test]
    fn resolves_through_base_chain_when_override_has_no_handler() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(BasePlugin));
        registry.register(Arc::new(OverridePlugin));
        let resolved = registry.build_handler("container").unwrap();
        assert!(resolved.base.is_none()); // override had no handler, base IS the handler
    }

    #[test]
    fn unknown_handler_fails_with_plugin_not_implemented() {
        let registry = PluginRegistry::new();
        let err = registry.deploy_handler("nonexistent").unwrap_err();
        assert!(matches!(err, EngineError::Plugin { .. }));
    }
}
