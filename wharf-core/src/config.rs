//! The on-disk YAML configuration schema (spec.md §6) and the loader that
//! turns a directory of documents into the flat `ActionConfig` list the
//! Graph Builder consumes (spec.md §4.3 step 1, "normalize each config").
//!
//! The loader is a declared external collaborator (spec.md §1: "we specify
//! the configuration schema it must yield"); what matters for the engine
//! is the shape it must produce, not this particular directory-walking
//! implementation. Grounded on the teacher's `yaml::ConfigFile` /
//! `Into<Application>` pattern (`cloud-conveyor-core::yaml`): one small
//! `serde`-derived struct per document kind, each converted into the
//! engine's own types by an explicit function rather than a blanket
//! deserialize-into-domain-type.
//!
//! `ConfigTemplate`/`RenderTemplate` documents (whole-file template
//! rendering, as opposed to the `${...}` string templates inside a spec)
//! are recognized by `kind` so a project mixing them in doesn't fail to
//! parse, but are not expanded into actions here — rendering a templated
//! *document* is a distinct feature from the in-scope Template Resolver,
//! which operates on string values inside an already-parsed spec (see
//! DESIGN.md).

use crate::action::{ActionConfig, ActionKind, ActionRef};
use crate::error::{EngineError, Result};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One parsed environment block from a `Project` document.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentDoc {
    /// The environment's name, as referenced by `--env`.
    pub name: String,
    /// Plain variables available under `${environment.*}`.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    /// Secret references available under `${environment.secrets.*}`.
    #[serde(default)]
    pub secrets: Map<String, JsonValue>,
}

/// One provider config block from a `Project` document.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderDoc {
    /// The provider's instance name (distinct from its plugin type).
    pub name: String,
    /// The plugin type tag this provider config belongs to.
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Opaque provider-specific config, passed through to handlers.
    #[serde(default)]
    pub config: JsonValue,
}

/// The `Project` document: one per project, declares environments,
/// providers, and project-wide variables.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProjectDoc {
    /// The project's name.
    pub name: String,
    /// The environment used when `--env` is not passed.
    #[serde(default)]
    pub default_environment: Option<String>,
    /// Declared environments.
    #[serde(default)]
    pub environments: Vec<EnvironmentDoc>,
    /// Project-wide variables, available under `${project.*}`.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    /// Declared providers.
    #[serde(default)]
    pub providers: Vec<ProviderDoc>,
}

/// A `Group` document: variables/varfiles shared by every action document
/// that declares `group: <name>` (spec.md §4.3 "Groups").
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GroupDoc {
    /// The group's name, referenced by an action document's `group` field.
    pub name: String,
    /// Variables every member of the group inherits, overridable per-action.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    /// Varfiles every member of the group loads, resolved relative to this
    /// document's own file.
    #[serde(default)]
    pub varfiles: Vec<PathBuf>,
}

/// The shape shared by `Build`, `Deploy`, `Run`, and `Test` documents
/// (spec.md §6 "All actions"). Kind-specific fields (`copyFrom`,
/// `allowPublish`, `build`) are simply ignored by kinds that don't use
/// them.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ActionDoc {
    /// The action's name, unique among actions of its kind.
    pub name: String,
    /// The provider-specific type tag.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Human-readable description; not used by the engine.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the action is disabled.
    #[serde(default)]
    pub disabled: bool,
    /// Declared dependencies, as `<kind>.<name>` strings.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// The (possibly templated) spec tree.
    #[serde(default)]
    pub spec: JsonValue,
    /// Action-local variables, overriding any group/varfile variables.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    /// Varfiles to merge in as additional variables, resolved relative to
    /// this document's own file, applied before `variables` (spec.md §6).
    #[serde(default)]
    pub varfiles: Vec<PathBuf>,
    /// Execution timeout, in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// The `Group` this action belongs to, if any.
    #[serde(default)]
    pub group: Option<String>,
    /// `Build`-only: copies the action's source from another build's
    /// output rather than `source_path`. Folded into `spec.copyFrom`.
    #[serde(default, rename = "copyFrom")]
    pub copy_from: Option<String>,
    /// `Build`-only: whether `publish` may be invoked for this build.
    /// Folded into `spec.allowPublish`.
    #[serde(default, rename = "allowPublish")]
    pub allow_publish: Option<bool>,
    /// `Deploy`/`Run`/`Test`-only: the `Build` action this one builds
    /// from, added as an implicit `build.<name>` dependency.
    #[serde(default)]
    pub build: Option<String>,
}

/// One task entry inside a legacy `Module` document's `tasks`/`tests` list.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleTaskDoc {
    /// The task's name; becomes the produced action's name.
    pub name: String,
    /// The task's spec.
    #[serde(default)]
    pub spec: JsonValue,
    /// Additional dependencies beyond the module's own build/deploy.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A legacy `Module` document: a single block that expands into one
/// `Build` action plus zero or more `Deploy`/`Run`/`Test` actions
/// (spec.md §4.3 step 1 "apply module→action conversion").
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModuleDoc {
    /// The module's name; shared by its produced `Build` and `Deploy`
    /// actions.
    pub name: String,
    /// The provider type tag shared across the module's produced actions.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Whether the whole module is disabled.
    #[serde(default)]
    pub disabled: bool,
    /// Dependencies attached to the module's `Build` action.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// The `Build` action's spec.
    #[serde(default)]
    pub build: JsonValue,
    /// If present, the module also produces a `Deploy` action with this
    /// spec, depending on the module's own build.
    #[serde(default)]
    pub deploy: Option<JsonValue>,
    /// Produces one `Run` action per entry.
    #[serde(default)]
    pub tasks: Vec<ModuleTaskDoc>,
    /// Produces one `Test` action per entry.
    #[serde(default)]
    pub tests: Vec<ModuleTaskDoc>,
    /// Shared variables for every action the module produces.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    /// Shared timeout for every action the module produces.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// One `---`-separated YAML document, tagged by its `kind` field
/// (spec.md §6: "Each document declares exactly one kind of `Project |
/// Module | Build | Deploy | Run | Test | ConfigTemplate | RenderTemplate
/// | Group`").
#[derive(Debug, Deserialize)]
#[serde(tag = "kind")]
enum Document {
    Project(ProjectDoc),
    Group(GroupDoc),
    Module(ModuleDoc),
    Build(ActionDoc),
    Deploy(ActionDoc),
    Run(ActionDoc),
    Test(ActionDoc),
    ConfigTemplate(JsonValue),
    RenderTemplate(JsonValue),
}

/// Everything the loader extracted from a project directory: the single
/// `Project` document's contents plus the flat, normalized action list
/// ready for [`crate::graph::GraphBuilder`].
#[derive(Debug, Default)]
pub struct LoadedProject {
    /// The parsed `Project` document, if the directory declared one.
    pub project: Option<ProjectDoc>,
    /// Declared environments, keyed by name.
    pub environments: HashMap<String, EnvironmentDoc>,
    /// Declared providers, keyed by name.
    pub providers: HashMap<String, ProviderDoc>,
    /// The flat, normalized action list.
    pub actions: Vec<ActionConfig>,
}

/// Loads every `*.yaml`/`*.yml` file under `root` (recursively) and
/// assembles a [`LoadedProject`]. Fails fast with a `ConfigurationError`
/// naming the offending file on the first parse error, per spec.md §4.3
/// ("the graph is not partially constructed").
pub fn load_directory(root: &Path) -> Result<LoadedProject> {
    let mut files = Vec::new();
    collect_yaml_files(root, &mut files)?;
    files.sort();

    let mut raw_docs: Vec<(PathBuf, Document)> = Vec::new();
    for path in &files {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Configuration {
            path: path.display().to_string(),
            message: format!("failed to read file: {e}"),
        })?;
        for document in serde_yaml::Deserializer::from_str(&content) {
            let doc = Document::deserialize(document).map_err(|e| EngineError::Configuration {
                path: path.display().to_string(),
                message: format!("invalid document: {e}"),
            })?;
            raw_docs.push((path.clone(), doc));
        }
    }

    let mut groups: HashMap<String, GroupDoc> = HashMap::new();
    for (_, doc) in &raw_docs {
        if let Document::Group(g) = doc {
            groups.insert(g.name.clone(), g.clone());
        }
    }

    let mut loaded = LoadedProject::default();
    for (path, doc) in raw_docs {
        let dir = path.parent().unwrap_or(root).to_path_buf();
        match doc {
            Document::Group(_) => {} // already indexed above
            Document::Project(p) => {
                for env in &p.environments {
                    loaded.environments.insert(env.name.clone(), env.clone());
                }
                for provider in &p.providers {
                    loaded.providers.insert(provider.name.clone(), provider.clone());
                }
                loaded.project = Some(p);
            }
            Document::Build(doc) => {
                loaded.actions.push(build_action_config(ActionKind::Build, doc, &groups, &dir, root)?);
            }
            Document::Deploy(doc) => {
                loaded.actions.push(build_action_config(ActionKind::Deploy, doc, &groups, &dir, root)?);
            }
            Document::Run(doc) => {
                loaded.actions.push(build_action_config(ActionKind::Run, doc, &groups, &dir, root)?);
            }
            Document::Test(doc) => {
                loaded.actions.push(build_action_config(ActionKind::Test, doc, &groups, &dir, root)?);
            }
            Document::Module(module) => {
                loaded.actions.extend(expand_module(module, &dir, root)?);
            }
            Document::ConfigTemplate(_) | Document::RenderTemplate(_) => {
                // Whole-document template rendering; not part of the
                // in-scope Template Resolver. See module docs.
            }
        }
    }

    Ok(loaded)
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| EngineError::Configuration {
        path: dir.display().to_string(),
        message: format!("failed to read directory: {e}"),
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::Configuration {
            path: dir.display().to_string(),
            message: format!("failed to read directory entry: {e}"),
        })?;
        let path = entry.path();
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name == ".git" || file_name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml")) {
            out.push(path);
        }
    }
    Ok(())
}

fn load_varfile(path: &Path, base_dir: &Path) -> Result<Map<String, JsonValue>> {
    let resolved = if path.is_absolute() { path.to_path_buf() } else { base_dir.join(path) };
    let content = std::fs::read_to_string(&resolved).map_err(|e| EngineError::Configuration {
        path: resolved.display().to_string(),
        message: format!("failed to read varfile: {e}"),
    })?;
    let value: JsonValue = serde_yaml::from_str(&content).map_err(|e| EngineError::Configuration {
        path: resolved.display().to_string(),
        message: format!("invalid varfile: {e}"),
    })?;
    match value {
        JsonValue::Object(map) => Ok(map),
        other => Err(EngineError::Configuration {
            path: resolved.display().to_string(),
            message: format!("varfile must contain a mapping, found {other}"),
        }),
    }
}

/// Merges `overlay` onto `base`, with `overlay`'s keys winning on
/// conflict — the same "later key wins" policy spec.md §9 specifies for
/// `$merge`.
fn merge_maps(base: &mut Map<String, JsonValue>, overlay: Map<String, JsonValue>) {
    for (k, v) in overlay {
        base.insert(k, v);
    }
}

fn resolve_variables(
    inline: Map<String, JsonValue>,
    varfiles: &[PathBuf],
    group: Option<&GroupDoc>,
    dir: &Path,
) -> Result<Map<String, JsonValue>> {
    let mut merged = Map::new();
    if let Some(group) = group {
        merge_maps(&mut merged, group.variables.clone());
        for varfile in &group.varfiles {
            merge_maps(&mut merged, load_varfile(varfile, dir)?);
        }
    }
    for varfile in varfiles {
        merge_maps(&mut merged, load_varfile(varfile, dir)?);
    }
    merge_maps(&mut merged, inline);
    Ok(merged)
}

fn build_action_config(
    kind: ActionKind,
    doc: ActionDoc,
    groups: &HashMap<String, GroupDoc>,
    dir: &Path,
    root: &Path,
) -> Result<ActionConfig> {
    let group = doc.group.as_deref().and_then(|g| groups.get(g));
    let variables = resolve_variables(doc.variables, &doc.varfiles, group, dir)?;

    let mut dependencies = parse_dependencies(&doc.name, kind, &doc.dependencies)?;
    if matches!(kind, ActionKind::Deploy | ActionKind::Run | ActionKind::Test) {
        if let Some(build_name) = &doc.build {
            let build_ref = ActionRef::new(ActionKind::Build, build_name.clone());
            if !dependencies.contains(&build_ref) {
                dependencies.push(build_ref);
            }
        }
    }

    let mut spec = doc.spec;
    if kind == ActionKind::Build {
        if let JsonValue::Object(map) = &mut spec {
            if let Some(copy_from) = doc.copy_from {
                map.insert("copyFrom".into(), JsonValue::String(copy_from));
            }
            if let Some(allow_publish) = doc.allow_publish {
                map.insert("allowPublish".into(), JsonValue::Bool(allow_publish));
            }
        }
    }

    Ok(ActionConfig {
        action_ref: ActionRef::new(kind, doc.name),
        action_type: doc.action_type,
        source_path: relative_source_path(dir, root),
        dependencies,
        spec,
        disabled: doc.disabled,
        timeout: doc.timeout.map(Duration::from_secs),
        variables,
        template_refs: Default::default(),
    })
}

fn parse_dependencies(owner: &str, kind: ActionKind, raw: &[String]) -> Result<Vec<ActionRef>> {
    raw.iter()
        .map(|s| {
            ActionRef::parse(s).ok_or_else(|| EngineError::Configuration {
                path: format!("{kind}.{owner}.dependencies"),
                message: format!("invalid dependency string '{s}', expected '<kind>.<name>'"),
            })
        })
        .collect()
}

fn relative_source_path(dir: &Path, root: &Path) -> String {
    dir.strip_prefix(root)
        .unwrap_or(dir)
        .to_string_lossy()
        .into_owned()
}

/// Expands a legacy `Module` document into one `Build` action plus zero or
/// more `Deploy`/`Run`/`Test` actions, per spec.md §4.3 step 1.
fn expand_module(module: ModuleDoc, dir: &Path, root: &Path) -> Result<Vec<ActionConfig>> {
    let mut out = Vec::new();
    let source_path = relative_source_path(dir, root);
    let build_ref = ActionRef::new(ActionKind::Build, module.name.clone());

    let build_deps = parse_dependencies(&module.name, ActionKind::Build, &module.dependencies)?;
    out.push(ActionConfig {
        action_ref: build_ref.clone(),
        action_type: module.action_type.clone(),
        source_path: source_path.clone(),
        dependencies: build_deps,
        spec: module.build,
        disabled: module.disabled,
        timeout: module.timeout.map(Duration::from_secs),
        variables: module.variables.clone(),
        template_refs: Default::default(),
    });

    if let Some(deploy_spec) = module.deploy {
        out.push(ActionConfig {
            action_ref: ActionRef::new(ActionKind::Deploy, module.name.clone()),
            action_type: module.action_type.clone(),
            source_path: source_path.clone(),
            dependencies: vec![build_ref.clone()],
            spec: deploy_spec,
            disabled: module.disabled,
            timeout: module.timeout.map(Duration::from_secs),
            variables: module.variables.clone(),
            template_refs: Default::default(),
        });
    }

    for task in module.tasks {
        let mut dependencies = vec![build_ref.clone()];
        dependencies.extend(parse_dependencies(&task.name, ActionKind::Run, &task.dependencies)?);
        out.push(ActionConfig {
            action_ref: ActionRef::new(ActionKind::Run, task.name),
            action_type: module.action_type.clone(),
            source_path: source_path.clone(),
            dependencies,
            spec: task.spec,
            disabled: module.disabled,
            timeout: module.timeout.map(Duration::from_secs),
            variables: module.variables.clone(),
            template_refs: Default::default(),
        });
    }

    for test in module.tests {
        let mut dependencies = vec![build_ref.clone()];
        dependencies.extend(parse_dependencies(&test.name, ActionKind::Test, &test.dependencies)?);
        out.push(ActionConfig {
            action_ref: ActionRef::new(ActionKind::Test, test.name),
            action_type: module.action_type.clone(),
            source_path: source_path.clone(),
            dependencies,
            spec: test.spec,
            disabled: module.disabled,
            timeout: module.timeout.map(Duration::from_secs),
            variables: module.variables.clone(),
            template_refs: Default::default(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_build_and_deploy_with_implicit_build_dependency() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "project.yaml",
            "kind: Project\nname: demo\n",
        );
        write_file(
            dir.path(),
            "actions.yaml",
            "kind: Build\nname: api\ntype: exec\nspec:\n  command: echo\n---\nkind: Deploy\nname: api\ntype: exec\nbuild: api\nspec:\n  command: echo\n",
        );
        let loaded = load_directory(dir.path()).unwrap();
        assert_eq!(loaded.project.unwrap().name, "demo");
        assert_eq!(loaded.actions.len(), 2);
        let deploy = loaded
            .actions
            .iter()
            .find(|a| a.action_ref.kind == ActionKind::Deploy)
            .unwrap();
        assert!(deploy.dependencies.contains(&ActionRef::new(ActionKind::Build, "api")));
    }

    #[test]
    fn group_variables_are_overridden_by_action_variables() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "docs.yaml",
            "kind: Group\nname: shared\nvariables:\n  region: us-east-1\n  tier: small\n---\nkind: Build\nname: api\ntype: exec\ngroup: shared\nvariables:\n  tier: large\nspec: {}\n",
        );
        let loaded = load_directory(dir.path()).unwrap();
        let build = &loaded.actions[0];
        assert_eq!(build.variables.get("region").unwrap(), "us-east-1");
        assert_eq!(build.variables.get("tier").unwrap(), "large");
    }

    #[test]
    fn module_expands_into_build_and_deploy() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "module.yaml",
            "kind: Module\nname: api\ntype: exec\nbuild:\n  command: echo\ndeploy:\n  command: echo\n",
        );
        let loaded = load_directory(dir.path()).unwrap();
        assert_eq!(loaded.actions.len(), 2);
        assert!(loaded
            .actions
            .iter()
            .any(|a| a.action_ref == ActionRef::new(ActionKind::Build, "api")));
        assert!(loaded
            .actions
            .iter()
            .any(|a| a.action_ref == ActionRef::new(ActionKind::Deploy, "api")
                && a.dependencies.contains(&ActionRef::new(ActionKind::Build, "api"))));
    }

    #[test]
    fn rejects_malformed_dependency_string() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "actions.yaml",
            "kind: Build\nname: api\ntype: exec\ndependencies:\n  - not-a-valid-ref\nspec: {}\n",
        );
        assert!(load_directory(dir.path()).is_err());
    }
}
