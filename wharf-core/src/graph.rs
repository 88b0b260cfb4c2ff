//! The Graph Builder and the immutable `ConfigGraph` it produces
//! (spec.md §3/§4.3).
//!
//! Grounded on the teacher's `Application`/`Stage` assembly in
//! `cloud-conveyor-core::lib` (a flat list of declarations turned into one
//! validated in-memory object graph before anything runs), generalized to a
//! typed DAG over four action kinds with template-driven implicit
//! dependencies, which the teacher's config never needed.

use crate::action::{ActionConfig, ActionKind, ActionRef};
use crate::error::{EngineError, Result};
use crate::template::{self, ResolveOptions};
use std::collections::{BTreeSet, HashMap, HashSet};

/// The immutable DAG over actions and their dependencies (spec.md §3).
#[derive(Debug, Default)]
pub struct ConfigGraph {
    actions: HashMap<ActionRef, ActionConfig>,
    edges: HashMap<ActionRef, BTreeSet<ActionRef>>,
}

impl ConfigGraph {
    /// Returns the config for a single action, if it exists.
    pub fn get(&self, action_ref: &ActionRef) -> Option<&ActionConfig> {
        self.actions.get(action_ref)
    }

    /// Returns every action, optionally restricted to `refs` and filtered
    /// with `filter`.
    pub fn get_actions<'a>(
        &'a self,
        refs: Option<&'a [ActionRef]>,
        filter: impl Fn(&ActionConfig) -> bool + 'a,
    ) -> Vec<&'a ActionConfig> {
        let candidates: Box<dyn Iterator<Item = &ActionConfig>> = match refs {
            Some(refs) => Box::new(refs.iter().filter_map(|r| self.actions.get(r))),
            None => Box::new(self.actions.values()),
        };
        candidates.filter(|a| filter(a)).collect()
    }

    /// The direct (or, if `recursive`, transitive) dependencies of `action_ref`.
    pub fn get_dependencies(&self, action_ref: &ActionRef, recursive: bool) -> BTreeSet<ActionRef> {
        let Some(direct) = self.edges.get(action_ref) else {
            return BTreeSet::new();
        };
        if !recursive {
            return direct.clone();
        }
        let mut seen = BTreeSet::new();
        let mut stack: Vec<ActionRef> = direct.iter().cloned().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                if let Some(deps) = self.edges.get(&next) {
                    stack.extend(deps.iter().cloned());
                }
            }
        }
        seen
    }

    /// The direct (or, if `recursive`, transitive) dependants of `action_ref`:
    /// every action that depends on it.
    pub fn get_dependants(&self, action_ref: &ActionRef, recursive: bool) -> BTreeSet<ActionRef> {
        self.get_dependants_for_many(std::slice::from_ref(action_ref), recursive)
    }

    /// The union of dependants across several actions at once.
    pub fn get_dependants_for_many(
        &self,
        action_refs: &[ActionRef],
        recursive: bool,
    ) -> BTreeSet<ActionRef> {
        let targets: HashSet<&ActionRef> = action_refs.iter().collect();
        let mut direct = BTreeSet::new();
        for (candidate, deps) in &self.edges {
            if deps.iter().any(|d| targets.contains(d)) {
                direct.insert(candidate.clone());
            }
        }
        if !recursive {
            return direct;
        }
        let mut seen = direct.clone();
        let mut stack: Vec<ActionRef> = direct.into_iter().collect();
        while let Some(next) = stack.pop() {
            for (candidate, deps) in &self.edges {
                if deps.contains(&next) && seen.insert(candidate.clone()) {
                    stack.push(candidate.clone());
                }
            }
        }
        seen
    }

    /// A topological ordering of every action in the graph (dependencies
    /// before dependants). `Err` only if the graph contains a cycle, which
    /// should never happen for a graph this module produced itself.
    pub fn topological_order(&self) -> Result<Vec<ActionRef>> {
        topo_sort(self.actions.keys().cloned().collect(), &self.edges)
    }

    /// Number of actions in the graph.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// True if the graph has no actions.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Kahn's algorithm in DFS-colouring form, detecting back-edges so the
/// offending cycle's two endpoints can be named in the error (spec.md §9).
fn topo_sort(
    nodes: Vec<ActionRef>,
    edges: &HashMap<ActionRef, BTreeSet<ActionRef>>,
) -> Result<Vec<ActionRef>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        Grey,
        Black,
    }

    let mut colour: HashMap<ActionRef, Colour> =
        nodes.iter().map(|n| (n.clone(), Colour::White)).collect();
    let mut order = Vec::with_capacity(nodes.len());

    fn visit(
        node: &ActionRef,
        edges: &HashMap<ActionRef, BTreeSet<ActionRef>>,
        colour: &mut HashMap<ActionRef, Colour>,
        order: &mut Vec<ActionRef>,
    ) -> Result<()> {
        match colour.get(node) {
            Some(Colour::Black) => return Ok(()),
            Some(Colour::Grey) => {
                return Err(EngineError::Configuration {
                    path: node.to_string(),
                    message: format!("dependency cycle detected at '{node}'"),
                })
            }
            _ => {}
        }
        colour.insert(node.clone(), Colour::Grey);
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                visit(dep, edges, colour, order).map_err(|e| match e {
                    EngineError::Configuration { path, message } => EngineError::Configuration {
                        path,
                        message: format!("{message} (reached via '{node}')"),
                    },
                    other => other,
                })?;
            }
        }
        colour.insert(node.clone(), Colour::Black);
        order.push(node.clone());
        Ok(())
    }

    for node in &nodes {
        visit(node, edges, &mut colour, &mut order)?;
    }
    Ok(order)
}

/// Builds a [`ConfigGraph`] from a flat list of parsed configs, following
/// the five steps of spec.md §4.3.
pub struct GraphBuilder {
    configs: Vec<ActionConfig>,
}

impl GraphBuilder {
    /// Starts a build over the given configs (already normalized: one
    /// config per declared Build/Deploy/Run/Test document).
    pub fn new(configs: Vec<ActionConfig>) -> Self {
        Self { configs }
    }

    /// Runs steps 2-4 of spec.md §4.3 (normalization is assumed done by the
    /// caller, since it depends on the YAML schema loader) and emits the
    /// immutable graph, or the first `ConfigurationError` encountered.
    pub fn build(mut self) -> Result<ConfigGraph> {
        // Step 2: scan specs for `actions.<kind>.<name>.outputs.*` refs and
        // fold them into each config's dependency list as implicit deps.
        for config in &mut self.configs {
            let found = template::scan_value_tree(&config.spec);
            let mut implicit = Vec::new();
            for key in &found {
                if let Some(rest) = key.strip_prefix("actions.") {
                    let mut parts = rest.splitn(3, '.');
                    if let (Some(kind_str), Some(name)) = (parts.next(), parts.next()) {
                        if let Some(kind) = ActionKind::parse_lowercase(kind_str) {
                            implicit.push(ActionRef::new(kind, name));
                        }
                    }
                }
            }
            config.template_refs = found;
            for dep in implicit {
                if !config.dependencies.contains(&dep) {
                    config.dependencies.push(dep);
                }
            }
        }

        // Step 4 (validation, done before topo-order since it's cheaper and
        // gives better error locality): no self-deps, no cross-kind
        // violations, every dependency target must exist.
        let known: HashSet<ActionRef> =
            self.configs.iter().map(|c| c.action_ref.clone()).collect();
        for config in &self.configs {
            if config.has_self_dependency() {
                return Err(EngineError::Configuration {
                    path: config.action_ref.to_string(),
                    message: "action declares itself as a dependency".into(),
                });
            }
            if let Some(bad) = config.has_invalid_dependency_kind() {
                return Err(EngineError::Configuration {
                    path: config.action_ref.to_string(),
                    message: format!(
                        "a '{}' action may not depend on '{}' ({})",
                        config.action_ref.kind, bad.kind, bad
                    ),
                });
            }
            for dep in &config.dependencies {
                if !known.contains(dep) {
                    return Err(EngineError::Configuration {
                        path: config.action_ref.to_string(),
                        message: format!("dependency '{dep}' does not exist"),
                    });
                }
            }
        }

        let edges: HashMap<ActionRef, BTreeSet<ActionRef>> = self
            .configs
            .iter()
            .map(|c| {
                (
                    c.action_ref.clone(),
                    c.dependencies.iter().cloned().collect(),
                )
            })
            .collect();

        // Step 3: cycle detection is a side effect of computing the
        // topological order; run it now so a cyclic graph is rejected
        // before being handed back as "built".
        topo_sort(self.configs.iter().map(|c| c.action_ref.clone()).collect(), &edges)?;

        let actions = self
            .configs
            .drain(..)
            .map(|c| (c.action_ref.clone(), c))
            .collect();

        Ok(ConfigGraph { actions, edges })
    }
}

/// Resolves every declared string template reference in `spec` against
/// `ctx`, in partial mode when `allow_partial` is set. Thin wrapper kept
/// here (rather than in `template`) so callers reason about it in terms of
/// "resolving an action's spec", matching spec.md's `ResolvedAction` step.
pub fn resolve_spec(
    spec: &serde_json::Value,
    ctx: &dyn template::Context,
    allow_partial: bool,
) -> Result<serde_json::Value> {
    let opts = ResolveOptions {
        allow_partial,
        unescape: true,
    };
    template::resolve_value_tree(spec, ctx, &opts).map_err(|e| EngineError::Configuration {
        path: String::new(),
        message: e.to_string(),
    })
}

/// Computes a stable content-hash version for every action in `graph`,
/// folding each action's dependencies' versions into its own so an
/// upstream change always propagates downward (spec.md §4.5 "Versioning").
///
/// Called once up front, before any task runs, so dependency outputs
/// aren't sealed in `ctx` yet: specs are resolved in partial mode and any
/// `actions.*.outputs.*` reference is left as literal source text. That's
/// fine — the dependency's own version is folded in immediately after, so
/// a change three levels upstream still changes every descendant's
/// version even though none of their literal spec text changed.
pub fn compute_versions(
    graph: &ConfigGraph,
    ctx: &dyn template::Context,
) -> Result<HashMap<ActionRef, String>> {
    let order = graph.topological_order()?;
    let mut versions: HashMap<ActionRef, String> = HashMap::with_capacity(order.len());
    for action_ref in order {
        let config = graph
            .get(&action_ref)
            .expect("topological_order only returns refs present in the graph");
        let resolved_spec = resolve_spec(&config.spec, ctx, true)?;
        let resolved = crate::action::ResolvedAction {
            config: config.clone(),
            resolved_spec,
            version: String::new(),
        };
        let dep_versions: Vec<&str> = config
            .dependencies
            .iter()
            .filter_map(|d| versions.get(d))
            .map(|s| s.as_str())
            .collect();
        let version = crate::task::compute_version(&resolved, &dep_versions);
        versions.insert(action_ref, version);
    }
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(kind: ActionKind, name: &str, deps: Vec<ActionRef>, spec: serde_json::Value) -> ActionConfig {
        ActionConfig {
            action_ref: ActionRef::new(kind, name),
            action_type: "container".into(),
            source_path: ".".into(),
            dependencies: deps,
            spec,
            disabled: false,
            timeout: None,
            variables: Default::default(),
            template_refs: Default::default(),
        }
    }

    #[test]
    fn builds_simple_build_then_deploy_graph() {
        let b = config(ActionKind::Build, "api", vec![], json!({}));
        let d = config(
            ActionKind::Deploy,
            "api",
            vec![ActionRef::new(ActionKind::Build, "api")],
            json!({}),
        );
        let graph = GraphBuilder::new(vec![b, d]).build().unwrap();
        assert_eq!(graph.len(), 2);
        let order = graph.topological_order().unwrap();
        let build_pos = order
            .iter()
            .position(|r| r.kind == ActionKind::Build)
            .unwrap();
        let deploy_pos = order
            .iter()
            .position(|r| r.kind == ActionKind::Deploy)
            .unwrap();
        assert!(build_pos < deploy_pos);
    }

    #[test]
    fn rejects_two_node_cycle() {
        let a = config(
            ActionKind::Deploy,
            "a",
            vec![ActionRef::new(ActionKind::Deploy, "b")],
            json!({}),
        );
        let b = config(
            ActionKind::Deploy,
            "b",
            vec![ActionRef::new(ActionKind::Deploy, "a")],
            json!({}),
        );
        let err = GraphBuilder::new(vec![a, b]).build().unwrap_err();
        match err {
            EngineError::Configuration { message, .. } => {
                assert!(message.contains("cycle"));
            }
            other => panic!("expected Configuration error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_three_node_cycle() {
        let a = config(
            ActionKind::Deploy,
            "a",
            vec![ActionRef::new(ActionKind::Deploy, "b")],
            json!({}),
        );
        let b = config(
            ActionKind::Deploy,
            "b",
            vec![ActionRef::new(ActionKind::Deploy, "c")],
            json!({}),
        );
        let c = config(
            ActionKind::Deploy,
            "c",
            vec![ActionRef::new(ActionKind::Deploy, "a")],
            json!({}),
        );
        assert!(GraphBuilder::new(vec![a, b, c]).build().is_err());
    }

    #[test]
    fn rejects_build_depending_on_deploy() {
        let d = config(ActionKind::Deploy, "api", vec![], json!({}));
        let b = config(
            ActionKind::Build,
            "api",
            vec![ActionRef::new(ActionKind::Deploy, "api")],
            json!({}),
        );
        let err = GraphBuilder::new(vec![d, b]).build().unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[test]
    fn infers_implicit_dependency_from_template_ref() {
        let b = config(ActionKind::Build, "api", vec![], json!({}));
        let d = config(
            ActionKind::Deploy,
            "api",
            vec![],
            json!({"image": "${actions.build.api.outputs.image}"}),
        );
        let graph = GraphBuilder::new(vec![b, d]).build().unwrap();
        let deps = graph.get_dependencies(&ActionRef::new(ActionKind::Deploy, "api"), false);
        assert!(deps.contains(&ActionRef::new(ActionKind::Build, "api")));
    }

    #[test]
    fn dependants_and_dependencies_are_inverses() {
        let b = config(ActionKind::Build, "api", vec![], json!({}));
        let d = config(
            ActionKind::Deploy,
            "api",
            vec![ActionRef::new(ActionKind::Build, "api")],
            json!({}),
        );
        let graph = GraphBuilder::new(vec![b, d]).build().unwrap();
        let build_ref = ActionRef::new(ActionKind::Build, "api");
        let deploy_ref = ActionRef::new(ActionKind::Deploy, "api");
        assert!(graph.get_dependants(&build_ref, false).contains(&deploy_ref));
        assert!(graph.get_dependencies(&deploy_ref, false).contains(&build_ref));
    }

    #[test]
    fn version_changes_when_a_dependency_changes() {
        let ctx = crate::context::LayeredContext::new();
        let b = config(ActionKind::Build, "api", vec![], json!({"dockerfile": "Dockerfile"}));
        let d = config(
            ActionKind::Deploy,
            "api",
            vec![ActionRef::new(ActionKind::Build, "api")],
            json!({}),
        );
        let graph = GraphBuilder::new(vec![b.clone(), d.clone()]).build().unwrap();
        let versions = compute_versions(&graph, &ctx).unwrap();
        let deploy_v1 = versions[&ActionRef::new(ActionKind::Deploy, "api")].clone();

        let b2 = config(ActionKind::Build, "api", vec![], json!({"dockerfile": "Dockerfile2"}));
        let graph2 = GraphBuilder::new(vec![b2, d]).build().unwrap();
        let versions2 = compute_versions(&graph2, &ctx).unwrap();
        let deploy_v2 = versions2[&ActionRef::new(ActionKind::Deploy, "api")].clone();

        assert_ne!(deploy_v1, deploy_v2);
    }

    #[test]
    fn versions_are_stable_across_independent_runs() {
        let ctx = crate::context::LayeredContext::new();
        let b = config(ActionKind::Build, "api", vec![], json!({"dockerfile": "Dockerfile"}));
        let graph = GraphBuilder::new(vec![b]).build().unwrap();
        let v1 = compute_versions(&graph, &ctx).unwrap();
        let v2 = compute_versions(&graph, &ctx).unwrap();
        assert_eq!(
            v1[&ActionRef::new(ActionKind::Build, "api")],
            v2[&ActionRef::new(ActionKind::Build, "api")]
        );
    }
}
