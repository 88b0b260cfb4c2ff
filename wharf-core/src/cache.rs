//! The Result Cache (spec.md §3/§4.7): a process-local,
//! content-addressed store of the latest successful result per
//! `(kind, action_ref, version)`. `GetXStatus`/`GetXResult` tasks consult
//! it to short-circuit `X`; invalidation is purely by version change, there
//! is no time-based expiry (spec.md §4.7).
//!
//! Grounded on the pack's idiomatic choice of `dashmap` for exactly this
//! shape of concurrent cache (`supernovae-st-nika::executor::TaskExecutor`
//! caches providers the same way: a `DashMap` keyed by a small tuple/string,
//! read and written from many concurrent workers with no external lock).

use crate::action::ActionRef;
use crate::task::{TaskKind, TaskOutcome};
use dashmap::DashMap;

/// The cache key: which task kind's output this is, for which action, at
/// which content-hash version.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// The task kind the cached outcome belongs to (always an `X`, never a
    /// `GetXStatus`/`GetXResult` — those read the cache, they don't
    /// populate a parallel entry for themselves).
    pub kind: TaskKind,
    /// The action the outcome is for.
    pub action_ref: ActionRef,
    /// The version the outcome was produced at.
    pub version: String,
}

/// The process-local result cache (spec.md §4.7). Persistence beyond the
/// process is a plugin concern (see Open Questions in SPEC_FULL.md).
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: DashMap<CacheKey, TaskOutcome>,
}

impl ResultCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful outcome. Per spec.md §4.7 "Writes occur on
    /// successful `X` completion" — callers should not insert failed
    /// outcomes.
    pub fn put(&self, kind: TaskKind, action_ref: ActionRef, version: String, outcome: TaskOutcome) {
        debug_assert!(
            outcome.is_success(),
            "only successful outcomes should be cached"
        );
        self.entries.insert(
            CacheKey {
                kind,
                action_ref,
                version,
            },
            outcome,
        );
    }

    /// Looks up a cached outcome for the exact `(kind, action_ref, version)`.
    /// A version bump (any byte of the resolved spec, or any dependency's
    /// version, changing) produces a cache miss even though the action_ref
    /// is otherwise the same entry (spec.md §8 cache property).
    pub fn get(&self, kind: TaskKind, action_ref: &ActionRef, version: &str) -> Option<TaskOutcome> {
        self.entries
            .get(&CacheKey {
                kind,
                action_ref: action_ref.clone(),
                version: version.to_string(),
            })
            .map(|entry| entry.clone())
    }

    /// Drops every cached entry for `action_ref`, regardless of version.
    /// Used by the watch loop when a source change makes every cached
    /// version for an action suspect (a new version will naturally miss
    /// anyway, but this keeps the cache from growing unboundedly with
    /// stale entries across a long `dev` session).
    pub fn invalidate_action(&self, action_ref: &ActionRef) {
        self.entries.retain(|key, _| &key.action_ref != action_ref);
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use serde_json::Value;
    use std::time::SystemTime;

    fn outcome(task_key: &str) -> TaskOutcome {
        TaskOutcome {
            task_key: task_key.into(),
            status: crate::task::TaskStatus::Ready,
            output: Value::Null,
            log: String::new(),
            started_at: SystemTime::now(),
            completed_at: SystemTime::now(),
            error: None,
        }
    }

    #[test]
    fn hit_requires_exact_version_match() {
        let cache = ResultCache::new();
        let api = ActionRef::new(ActionKind::Build, "api");
        cache.put(TaskKind::Build, api.clone(), "v1".into(), outcome("build:api:v1"));
        assert!(cache.get(TaskKind::Build, &api, "v1").is_some());
        assert!(cache.get(TaskKind::Build, &api, "v2").is_none());
    }

    #[test]
    fn invalidate_action_drops_every_version() {
        let cache = ResultCache::new();
        let api = ActionRef::new(ActionKind::Build, "api");
        cache.put(TaskKind::Build, api.clone(), "v1".into(), outcome("build:api:v1"));
        cache.invalidate_action(&api);
        assert!(cache.get(TaskKind::Build, &api, "v1").is_none());
    }
}
