//! Builds the [`WatchedRoot`] list a command needs to start
//! [`wharf_core::watch::SourceWatcher`], from the already-built graph and
//! the project's working directory.

use std::path::PathBuf;
use wharf_core::action::ActionRef;
use wharf_core::watch::{implicit_excludes, WatchedRoot};

use crate::session::Engine;

/// One watched root per action in `targets` whose source path resolves
/// under the project root, excluding the implicit `.git`/state-dir
/// patterns every root carries (spec.md §4.8).
pub fn watched_roots(engine: &Engine, targets: &[ActionRef]) -> Vec<WatchedRoot> {
    let excludes = implicit_excludes(&engine.runtime.working_dir);
    targets
        .iter()
        .filter_map(|action_ref| {
            let config = engine.graph.get(action_ref)?;
            let path: PathBuf = engine.runtime.project_root.join(&config.source_path);
            Some(WatchedRoot {
                action_ref: action_ref.clone(),
                path,
                excludes: excludes.clone(),
            })
        })
        .collect()
}
