//! The typed action model: four action kinds, their cross-kind dependency
//! rules, and the config/spec data carried alongside each action.
//!
//! Grounded on the teacher's [`Application`]/[`Stage`] split in
//! `cloud-conveyor-core::lib` and the `Build`/`Deploy`/`Teardown` structs in
//! `cloud-conveyor-core::pipelining`, generalized from three hard-coded
//! struct types into one `ActionKind` tag plus a uniform `ActionConfig`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// One of the four kinds of action a project can declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Produces an artifact (e.g. a container image) from source.
    Build,
    /// Creates or updates a long-running deployment of a built artifact.
    Deploy,
    /// Runs a one-off process, optionally depending on a build/deploy.
    Run,
    /// Runs a test suite, optionally depending on a build/deploy.
    Test,
}

impl ActionKind {
    /// Returns the kinds this kind is permitted to declare dependencies on,
    /// per the `ConfigGraph` invariant in spec.md §3: `Run`/`Test`/`Deploy`
    /// may depend on `Build`, `Deploy`, or `Run`; `Build` may only depend on
    /// other `Build`.
    pub fn allowed_dependency_kinds(self) -> &'static [ActionKind] {
        match self {
            ActionKind::Build => &[ActionKind::Build],
            ActionKind::Deploy | ActionKind::Run | ActionKind::Test => {
                &[ActionKind::Build, ActionKind::Deploy, ActionKind::Run]
            }
        }
    }

    /// Parses the lowercase kind tag used in `<kind>.<name>` dependency
    /// strings and `actions.<kind>.<name>.*` template paths.
    pub fn parse_lowercase(s: &str) -> Option<Self> {
        match s {
            "build" => Some(ActionKind::Build),
            "deploy" => Some(ActionKind::Deploy),
            "run" => Some(ActionKind::Run),
            "test" => Some(ActionKind::Test),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Build => "build",
            ActionKind::Deploy => "deploy",
            ActionKind::Run => "run",
            ActionKind::Test => "test",
        };
        f.write_str(s)
    }
}

/// `(kind, name)` — globally unique within a project.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionRef {
    /// The action's kind.
    pub kind: ActionKind,
    /// The action's declared name, unique among actions of the same kind.
    pub name: String,
}

impl ActionRef {
    /// Builds a new reference.
    pub fn new(kind: ActionKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Parses a dependency string of the form `<kind>.<name>`, as it appears
    /// in a YAML `dependencies:` list (spec.md §6).
    pub fn parse(s: &str) -> Option<Self> {
        let (kind_str, name) = s.split_once('.')?;
        let kind = ActionKind::parse_lowercase(kind_str)?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(kind, name))
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

/// Dev-mode file sync configuration attached to a `Deploy` action's spec.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DevModeSync {
    /// Source path on the local machine.
    pub source: String,
    /// Destination path inside the running container.
    pub target: String,
    /// Glob-style excludes, in addition to the implicit `.git` exclude.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// File mode applied to synced files. Default `0600` per spec.md §4.8.
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
    /// Directory mode applied to synced directories. Default `0700`.
    #[serde(default = "default_dir_mode")]
    pub dir_mode: u32,
}

fn default_file_mode() -> u32 {
    0o600
}

fn default_dir_mode() -> u32 {
    0o700
}

/// An immutable, parsed (but not necessarily fully resolved) action config.
///
/// Produced by the Graph Builder (spec.md §4.3) and never mutated after
/// construction; an "update" is a brand new `ActionConfig` with a new
/// content hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionConfig {
    /// The globally-unique reference for this action.
    pub action_ref: ActionRef,
    /// The provider-specific type tag, e.g. `container`, `kubernetes`, `exec`.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Directory the action's source lives under, relative to the project root.
    pub source_path: String,
    /// Declared dependencies (after parsing `<kind>.<name>` strings).
    pub dependencies: Vec<ActionRef>,
    /// The raw, not-yet-resolved spec tree (may contain `${...}` templates).
    pub spec: Value,
    /// Whether the action is disabled. Disabled actions are elided from
    /// scheduling but retained for reference resolution (spec.md §4.3 step 4).
    #[serde(default)]
    pub disabled: bool,
    /// Optional execution timeout.
    #[serde(default, with = "duration_secs_opt")]
    pub timeout: Option<Duration>,
    /// User-declared template variables available while resolving `spec`.
    #[serde(default)]
    pub variables: serde_json::Map<String, Value>,
    /// The set of context key paths `spec` touches, computed by a partial
    /// scan with the Template Resolver (spec.md §3). Populated by the Graph
    /// Builder, empty until then.
    #[serde(default)]
    pub template_refs: BTreeSet<String>,
}

impl ActionConfig {
    /// True if any dependency is on an action outside the kinds this
    /// action's kind is allowed to depend on (spec.md §3 invariant).
    pub fn has_invalid_dependency_kind(&self) -> Option<&ActionRef> {
        let allowed = self.action_ref.kind.allowed_dependency_kinds();
        self.dependencies
            .iter()
            .find(|dep| !allowed.contains(&dep.kind))
    }

    /// True if the action declares itself as its own dependency.
    pub fn has_self_dependency(&self) -> bool {
        self.dependencies.iter().any(|d| d == &self.action_ref)
    }
}

/// An `ActionConfig` whose `spec` has been fully evaluated against a
/// concrete context snapshot. Produced lazily, per-task, by the Graph
/// Builder / Context machinery (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolvedAction {
    /// The config this resolution was produced from.
    pub config: ActionConfig,
    /// The fully resolved spec tree (no remaining `${...}` fragments).
    pub resolved_spec: Value,
    /// Stable content hash of the resolved spec plus dependency versions.
    pub version: String,
}

impl ResolvedAction {
    /// Shorthand for the action's reference.
    pub fn action_ref(&self) -> &ActionRef {
        &self.config.action_ref
    }
}

mod duration_secs_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dependency_strings() {
        assert_eq!(
            ActionRef::parse("build.api"),
            Some(ActionRef::new(ActionKind::Build, "api"))
        );
        assert_eq!(
            ActionRef::parse("deploy.api-backend"),
            Some(ActionRef::new(ActionKind::Deploy, "api-backend"))
        );
        assert_eq!(ActionRef::parse("bogus.api"), None);
        assert_eq!(ActionRef::parse("build."), None);
        assert_eq!(ActionRef::parse("noDot"), None);
    }

    #[test]
    fn build_may_only_depend_on_build() {
        assert_eq!(
            ActionKind::Build.allowed_dependency_kinds(),
            &[ActionKind::Build]
        );
        assert!(ActionKind::Deploy
            .allowed_dependency_kinds()
            .contains(&ActionKind::Run));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let r = ActionRef::new(ActionKind::Test, "integration");
        assert_eq!(ActionRef::parse(&r.to_string()), Some(r));
    }
}
