//! The layered config-context hierarchy (spec.md §3/§4.2):
//! `ProjectContext ⊃ EnvironmentContext ⊃ ProviderOutputs ⊃ ActionOutputs ⊃
//! RuntimeContext`. Each layer is a [`template::Context`]; this module
//! composes them into one [`LayeredContext`] namespaced by the key path's
//! leading segment (`project.*`, `environment.*`, `providers.*`,
//! `actions.*`, `runtime.*`), and adds the one kind of laziness the plain
//! template resolver doesn't have: resolving `actions.<kind>.<name>.outputs.*`
//! before that action has been sealed either blocks (by reporting
//! unresolved/partial) or, if the same action is already mid-resolution on
//! this thread, reports a cycle.
//!
//! Grounded on the teacher's `RuntimeContext` (`cloud-conveyor-core::runtime`)
//! as the "one struct bundling everything a handler needs" pattern,
//! generalized from a single flat struct into the spec's explicit layering.

use crate::action::ActionRef;
use crate::template::{Context, LookupResult, PathSegment, ResolveOptions};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// A single, write-once layer over a flat JSON object.
///
/// `ProjectContext`, `EnvironmentContext`, and `RuntimeContext` (spec.md §3)
/// are all instances of this: static data, sealed exactly once at
/// construction time and read-only thereafter.
#[derive(Clone, Debug, Default)]
pub struct StaticLayer {
    data: Value,
}

impl StaticLayer {
    /// Creates a layer over a pre-built JSON object.
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    fn resolve_rest(&self, rest: &[PathSegment]) -> LookupResult {
        if rest.is_empty() {
            return LookupResult::found(self.data.clone());
        }
        let mut current = &self.data;
        for seg in rest {
            let next = match (seg, current) {
                (PathSegment::Key(k), Value::Object(map)) => map.get(k),
                (PathSegment::Index(i), Value::Array(arr)) => arr.get(*i),
                _ => None,
            };
            match next {
                Some(v) => current = v,
                None => return LookupResult::missing("key not found in static layer"),
            }
        }
        LookupResult::found(current.clone())
    }
}

/// `ProviderOutputs` (spec.md §3): outputs a provider plugin produced,
/// namespaced by provider name. Written once per provider as its config is
/// resolved; read-only thereafter, but "once per provider" means many small
/// writes over the lifetime of a Graph Builder pass, so this is a map
/// rather than a single static blob.
#[derive(Debug, Default)]
pub struct ProviderOutputsLayer {
    outputs: Mutex<HashMap<String, Value>>,
}

impl ProviderOutputsLayer {
    /// Creates an empty layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seals a provider's outputs. Panics on a second seal of the same
    /// provider: providers resolve exactly once per Graph Builder pass.
    pub fn seal(&self, provider: impl Into<String>, outputs: Value) {
        let provider = provider.into();
        let mut map = self.outputs.lock().expect("provider outputs mutex poisoned");
        if map.insert(provider.clone(), outputs).is_some() {
            panic!("provider '{provider}' outputs sealed twice");
        }
    }

    fn resolve_rest(&self, rest: &[PathSegment]) -> LookupResult {
        let (provider, tail) = match rest.split_first() {
            Some((PathSegment::Key(p), tail)) => (p.clone(), tail),
            _ => return LookupResult::missing("providers.<name>.* expected"),
        };
        let map = self.outputs.lock().expect("provider outputs mutex poisoned");
        let Some(root) = map.get(&provider) else {
            return LookupResult::missing(format!("provider '{provider}' has no outputs yet"));
        };
        StaticLayer::new(root.clone()).resolve_rest(tail)
    }
}

/// `ActionOutputs` (spec.md §3): the one genuinely lazy layer. Resolving
/// `actions.<kind>.<name>.outputs.*` before the action is sealed returns an
/// unresolved lookup (the scan/partial machinery then defers it); resolving
/// it while the *same* action is mid-resolution on this call is a cycle
/// (spec.md §4.2: "a resolution stack; revisiting a node in progress fails
/// with circular-reference").
#[derive(Debug, Default)]
pub struct ActionOutputsLayer {
    sealed: Mutex<HashMap<ActionRef, Value>>,
    in_progress: Mutex<HashSet<ActionRef>>,
}

impl ActionOutputsLayer {
    /// Creates an empty layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `action_ref` as currently being resolved. Returns an error
    /// message describing the cycle if it is already in progress.
    pub fn enter(&self, action_ref: &ActionRef) -> Result<(), String> {
        let mut in_progress = self.in_progress.lock().expect("action outputs mutex poisoned");
        if !in_progress.insert(action_ref.clone()) {
            return Err(format!(
                "circular reference while resolving outputs of '{action_ref}'"
            ));
        }
        Ok(())
    }

    /// Marks `action_ref` as no longer in progress, whether it finished
    /// successfully or failed.
    pub fn exit(&self, action_ref: &ActionRef) {
        self.in_progress
            .lock()
            .expect("action outputs mutex poisoned")
            .remove(action_ref);
    }

    /// Seals an action's outputs once it has finished resolving.
    pub fn seal(&self, action_ref: ActionRef, outputs: Value) {
        self.sealed
            .lock()
            .expect("action outputs mutex poisoned")
            .insert(action_ref, outputs);
    }

    /// True if `action_ref`'s outputs have been sealed.
    pub fn is_sealed(&self, action_ref: &ActionRef) -> bool {
        self.sealed
            .lock()
            .expect("action outputs mutex poisoned")
            .contains_key(action_ref)
    }

    fn resolve_rest(&self, rest: &[PathSegment]) -> LookupResult {
        let (kind, rest) = match rest.split_first() {
            Some((PathSegment::Key(k), tail)) => (k.clone(), tail),
            _ => return LookupResult::missing("actions.<kind>.<name>.* expected"),
        };
        let (name, rest) = match rest.split_first() {
            Some((PathSegment::Key(n), tail)) => (n.clone(), tail),
            _ => return LookupResult::missing("actions.<kind>.<name>.* expected"),
        };
        let Some(action_kind) = crate::action::ActionKind::parse_lowercase(&kind) else {
            return LookupResult::missing(format!("unknown action kind '{kind}'"));
        };
        let action_ref = ActionRef::new(action_kind, name);

        if self
            .in_progress
            .lock()
            .expect("action outputs mutex poisoned")
            .contains(&action_ref)
        {
            return LookupResult::circular(format!(
                "circular reference while resolving outputs of '{action_ref}'"
            ));
        }

        let sealed = self.sealed.lock().expect("action outputs mutex poisoned");
        let Some(root) = sealed.get(&action_ref) else {
            return LookupResult::missing(format!("'{action_ref}' has not resolved yet"));
        };
        StaticLayer::new(root.clone()).resolve_rest(rest)
    }
}

/// The full layered context a single Graph Builder pass or task resolution
/// uses: project variables, the active environment, provider outputs,
/// action outputs, and runtime context, composed behind one
/// [`template::Context`] implementation.
#[derive(Debug, Default)]
pub struct LayeredContext {
    /// `${project.*}` — project-level variables and metadata.
    pub project: StaticLayer,
    /// `${environment.*}` / `${env.*}` — the active environment's variables
    /// and secrets.
    pub environment: StaticLayer,
    /// `${providers.*}` — provider plugin config outputs.
    pub providers: ProviderOutputsLayer,
    /// `${actions.*}` — other actions' sealed outputs.
    pub actions: ActionOutputsLayer,
    /// `${runtime.*}` — invocation-local values (CLI flags, invocation id).
    pub runtime: StaticLayer,
    /// `${var.*}` / `${variables.*}` — the current action's own declared
    /// variables, overlaid last so an action's own `variables:` block can
    /// shadow nothing but is always reachable under its own namespace.
    pub variables: StaticLayer,
}

impl LayeredContext {
    /// Builds an empty layered context; layers are filled in as the Graph
    /// Builder seals them.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Context for LayeredContext {
    fn resolve(&self, key_path: &[PathSegment], opts: &ResolveOptions) -> LookupResult {
        let (head, rest) = match key_path.split_first() {
            Some((PathSegment::Key(h), rest)) => (h.as_str(), rest),
            _ => return LookupResult::missing("expected a leading identifier"),
        };
        match head {
            "project" => self.project.resolve_rest(rest),
            "environment" | "env" => self.environment.resolve_rest(rest),
            "providers" => self.providers.resolve_rest(rest),
            "actions" => self.actions.resolve_rest(rest),
            "runtime" => self.runtime.resolve_rest(rest),
            "var" | "variables" => self.variables.resolve_rest(rest),
            _ => {
                let _ = opts;
                LookupResult::missing(format!("unknown context namespace '{head}'"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::template::{resolve, ScanContext};
    use serde_json::json;

    #[test]
    fn resolves_through_namespace_dispatch() {
        let mut ctx = LayeredContext::new();
        ctx.project = StaticLayer::new(json!({"name": "demo"}));
        let opts = ResolveOptions::default();
        let v = resolve("${project.name}", &ctx, &opts).unwrap();
        assert_eq!(v, json!("demo"));
    }

    #[test]
    fn action_outputs_unresolved_before_sealing() {
        let ctx = LayeredContext::new();
        let opts = ResolveOptions {
            allow_partial: true,
            unescape: false,
        };
        let v = resolve("${actions.build.api.outputs.image}", &ctx, &opts).unwrap();
        assert_eq!(v, json!("${actions.build.api.outputs.image}"));
    }

    #[test]
    fn action_outputs_resolve_after_sealing() {
        let mut ctx = LayeredContext::new();
        let api = ActionRef::new(ActionKind::Build, "api");
        ctx.actions
            .seal(api, json!({"outputs": {"image": "registry/api:abc"}}));
        let opts = ResolveOptions::default();
        let v = resolve("${actions.build.api.outputs.image}", &ctx, &opts).unwrap();
        assert_eq!(v, json!("registry/api:abc"));
    }

    #[test]
    fn action_outputs_detects_cycle() {
        let ctx = LayeredContext::new();
        let api = ActionRef::new(ActionKind::Build, "api");
        ctx.actions.enter(&api).unwrap();
        let opts = ResolveOptions::default();
        let err = resolve("${actions.build.api.outputs.image}", &ctx, &opts).unwrap_err();
        assert!(matches!(
            err,
            crate::template::TemplateError::CircularReference(_)
        ));
    }

    #[test]
    fn reentering_in_progress_action_is_an_error() {
        let ctx = LayeredContext::new();
        let api = ActionRef::new(ActionKind::Build, "api");
        ctx.actions.enter(&api).unwrap();
        assert!(ctx.actions.enter(&api).is_err());
        ctx.actions.exit(&api);
        assert!(ctx.actions.enter(&api).is_ok());
    }

    #[test]
    fn scan_finds_action_output_refs_without_resolving() {
        let spec = json!({"image": "${actions.build.api.outputs.image}"});
        let found = crate::template::scan_value_tree(&spec);
        assert!(found.contains("actions.build.api.outputs.image"));
        let ctx = ScanContext::new();
        let _ = ctx; // scanning is exercised through scan_value_tree above
    }
}
