//! The `clap`-derived argument surface (spec.md §6 "CLI surface",
//! SPEC_FULL.md §6.1). The teacher's `cloud-conveyor-cli` used `clap` 2.x's
//! `App`/`SubCommand` builder API for a single `check` subcommand; every
//! other `clap`-dependent crate in the retrieval pack (`supernovae-st-nika`)
//! has already moved to 4.x derive macros, which is the idiomatic form
//! this crate follows instead.

use clap::{Args, Parser, Subcommand};

/// Command-line front end for the wharf developer-workflow orchestrator.
#[derive(Parser, Debug)]
#[command(name = "wharf", version, about = "Developer-workflow orchestrator for container-based applications")]
pub struct Cli {
    /// The environment to operate against (`GARDEN_ENV` if unset).
    #[arg(long, global = true)]
    pub env: Option<String>,

    /// Skip interactive confirmations.
    #[arg(short = 'y', long = "yes", global = true)]
    pub yes: bool,

    /// Bypass status/result short-circuiting for every scheduled task.
    #[arg(long, global = true)]
    pub force: bool,

    /// `tracing` filter directive (`GARDEN_LOG_LEVEL` if unset, default `info`).
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// The command to run.
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Deploys the project's Deploy actions (and their dependencies).
    Deploy {
        /// Restrict to these Deploy actions by name; defaults to all.
        names: Vec<String>,
    },

    /// Runs the project's Test actions (and their dependencies).
    Test {
        /// Restrict to these Test actions by name; defaults to all.
        names: Vec<String>,

        /// Re-run affected tests whenever a watched source changes.
        #[arg(long)]
        watch: bool,

        /// Replace Deploy prerequisites with a status check instead of a
        /// full deploy (spec.md §8 scenario 2).
        #[arg(long = "skip-dependencies")]
        skip_dependencies: bool,
    },

    /// Runs a single Build, Deploy, Run, Test, or workflow action on demand.
    Run {
        #[command(subcommand)]
        target: RunTarget,
    },

    /// Deletes a deployment, an environment's deployments, or a secret.
    Delete {
        #[command(subcommand)]
        target: DeleteTarget,
    },

    /// Deploys the project and keeps it in sync as sources change
    /// (spec.md §4.8 Watch & Reconcile Loop).
    Dev {
        /// Restrict to these Deploy actions by name; defaults to all.
        names: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum RunTarget {
    /// Runs a single Build action's `build` handler directly.
    Build { name: String },
    /// Runs a single Deploy action's `deploy` handler directly.
    Deploy { name: String },
    /// Runs a single Run action directly, ignoring any cached result.
    Task { name: String },
    /// Runs a single Test action directly, ignoring any cached result.
    Test { name: String },
    /// Runs a named multi-action workflow (out of the core engine's scope;
    /// see spec.md §1 Non-goals).
    Workflow { name: String },
}

#[derive(Subcommand, Debug)]
pub enum DeleteTarget {
    /// Tears down one or more Deploy actions.
    Deploy(DeleteDeployArgs),
    /// Tears down every Deploy action in an environment.
    Environment {
        /// The environment to tear down; defaults to the active one.
        name: Option<String>,
    },
    /// Removes a secret reference from the active environment.
    Secret {
        /// The secret's key.
        key: String,
    },
}

#[derive(Args, Debug)]
pub struct DeleteDeployArgs {
    /// The Deploy actions to tear down; defaults to all.
    pub names: Vec<String>,

    /// Delete each action's dependants before the action itself
    /// (spec.md §8 scenario 4).
    #[arg(long = "dependants-first")]
    pub dependants_first: bool,

    /// Also delete every dependant of each named action.
    #[arg(long = "with-dependants")]
    pub with_dependants: bool,
}
