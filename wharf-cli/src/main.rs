//! Entry point: parses argv, assembles [`Settings`] and an [`Engine`],
//! wires Ctrl-C into a [`wharf_core::solver::CancellationToken`], dispatches
//! to the matching command, and maps the result onto a process exit code
//! (spec.md §6 "CLI surface", SPEC_FULL.md §6.1 "exit codes").
//!
//! Grounded on the teacher's `cloud-conveyor-cli::main` for "one binary
//! crate, one `main`, argv in and an exit status out" -- generalized from
//! the teacher's single synchronous `check` subcommand into an async
//! dispatcher over five subcommands, since every handler this spec adds
//! drives `tokio`-based network and process I/O.

mod cli;
mod commands;
mod expand;
mod session;
mod settings;
mod watch_setup;

use clap::Parser;
use cli::{Cli, Command};
use session::Engine;
use settings::Settings;
use wharf_core::solver::CancellationToken;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

/// Resolves settings, assembles the engine, and dispatches to the
/// requested command. Returns the process exit code on success; actual
/// invocation failures (bad config, unknown action names, cancellation)
/// surface as `Err` and are mapped by [`exit_code_for`].
async fn run(cli: Cli) -> anyhow::Result<i32> {
    let settings = Settings::load(cli.env, cli.log_level, cli.force, cli.yes)?;
    init_tracing(&settings.log_level, settings.no_color);

    let cancel = CancellationToken::new();
    let ctrlc_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received Ctrl-C, cancelling in-flight tasks");
            ctrlc_cancel.cancel();
        }
    });

    let engine = Engine::assemble(&settings)?;

    let code = match cli.command {
        Command::Deploy { names } => commands::deploy(&engine, &names, settings.force, cancel).await?,
        Command::Test {
            names,
            watch,
            skip_dependencies,
        } => commands::test(&engine, &names, watch, skip_dependencies, settings.force, cancel).await?,
        Command::Run { target } => commands::run(&engine, &target, cancel).await?,
        Command::Delete { target } => commands::delete(&engine, &target, settings.force, cancel).await?,
        Command::Dev { names } => commands::dev(&engine, &names, cancel).await?,
    };

    Ok(code)
}

/// Installs a `tracing-subscriber` fmt layer filtered by `log_level`
/// (spec.md §6 "`--log-level`/`GARDEN_LOG_LEVEL`"), disabling ANSI color
/// codes when `no_color` is set.
fn init_tracing(log_level: &str, no_color: bool) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!no_color)
        .with_target(false)
        .try_init();
}

/// Best-effort exit code for an error that escaped `run` before a command
/// had the chance to return its own code: a downcast onto
/// [`wharf_core::EngineError`] if the failure came from the engine,
/// otherwise a generic configuration/parameter failure (`2`), matching
/// the convention that anything short of a scheduled task failing is a
/// usage or setup problem rather than a runtime one.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<wharf_core::EngineError>()
        .map(|e| e.exit_code())
        .unwrap_or(2)
}
