//! Invocation settings, layered `config`-crate style: built-in defaults <
//! `GARDEN_*`-prefixed environment variables < CLI flags (spec.md §6
//! "Environment variables", SPEC_FULL.md §9). `wharf-core` itself knows
//! nothing about any of this; it is purely a `wharf-cli` concern, the way
//! the teacher's binary crate alone knows about argv and env vars.

use anyhow::{Context, Result};
use config::{Config, Environment};
use serde::Deserialize;
use std::path::PathBuf;

fn default_environment() -> String {
    "local".into()
}

/// Settings assembled before CLI flags are applied. `GARDEN_PROJECT_ROOT`,
/// `GARDEN_WORKING_DIR`, and `GARDEN_LOG_LEVEL` map onto these by name;
/// `GARDEN_ENV` is handled separately below since its env var name doesn't
/// match the field it overrides.
#[derive(Debug, Clone, Deserialize, Default)]
struct RawSettings {
    project_root: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    #[serde(default)]
    log_level: Option<String>,
}

/// The fully-resolved settings for one invocation, after CLI flags have
/// been layered on top of the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the project being operated on.
    pub project_root: PathBuf,
    /// The `.garden`-equivalent state directory.
    pub working_dir: PathBuf,
    /// The active environment name.
    pub environment: String,
    /// `tracing` filter directive, e.g. `info`, `debug`, `wharf=trace`.
    pub log_level: String,
    /// `--force`: bypass status/result short-circuiting for every task.
    pub force: bool,
    /// `--yes`/`-y`: skip interactive confirmations.
    pub assume_yes: bool,
    /// Whether color output should be suppressed (`NO_COLOR`, spec.md §6).
    pub no_color: bool,
}

impl Settings {
    /// Loads env-layered defaults, then applies the CLI's global flags on
    /// top (flags always win over the environment, which always wins over
    /// the built-in defaults).
    pub fn load(
        env_override: Option<String>,
        log_level_override: Option<String>,
        force: bool,
        assume_yes: bool,
    ) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(
                Environment::with_prefix("GARDEN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to assemble layered settings from the environment")?;
        let raw: RawSettings = cfg
            .try_deserialize()
            .context("failed to parse GARDEN_* environment variables")?;

        let project_root = raw.project_root.unwrap_or_else(|| PathBuf::from("."));
        let working_dir = raw
            .working_dir
            .unwrap_or_else(|| project_root.join(".garden"));
        let environment = env_override
            .or_else(|| std::env::var("GARDEN_ENV").ok())
            .unwrap_or_else(default_environment);
        let log_level = log_level_override
            .or(raw.log_level)
            .unwrap_or_else(|| "info".to_string());
        let no_color = std::env::var_os("NO_COLOR").is_some();

        Ok(Self {
            project_root,
            working_dir,
            environment,
            log_level,
            force,
            assume_yes,
            no_color,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_win_over_defaults() {
        std::env::remove_var("GARDEN_ENV");
        std::env::remove_var("GARDEN_PROJECT_ROOT");
        std::env::remove_var("GARDEN_LOG_LEVEL");
        let settings = Settings::load(Some("staging".into()), Some("debug".into()), true, true).unwrap();
        assert_eq!(settings.environment, "staging");
        assert_eq!(settings.log_level, "debug");
        assert!(settings.force);
        assert!(settings.assume_yes);
    }

    #[test]
    fn defaults_apply_when_nothing_set() {
        std::env::remove_var("GARDEN_ENV");
        std::env::remove_var("GARDEN_PROJECT_ROOT");
        std::env::remove_var("GARDEN_LOG_LEVEL");
        let settings = Settings::load(None, None, false, false).unwrap();
        assert_eq!(settings.environment, "local");
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.project_root, PathBuf::from("."));
    }
}
