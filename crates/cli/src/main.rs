// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! berth - operator CLI for the Berth session manager.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod client;
mod commands;
mod output;

use clap::{Parser, Subcommand};
use commands::{admin, daemon, session};
use output::OutputFormat;

#[derive(Parser)]
#[command(
    name = "berth",
    version,
    about = "Berth - schedules compute sessions onto a fleet of worker agents"
)]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, default_value_t, global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a new session
    Enqueue(session::EnqueueArgs),
    /// List sessions, optionally filtered
    Sessions(session::MatchArgs),
    /// Show one session (id or unique prefix)
    Query { id: String },
    /// Cancel a pending session
    Cancel { id: String },
    /// Destroy a session wherever it is in its lifecycle
    Destroy { id: String },
    /// Forcibly terminate a session (operator hammer)
    ForceTerminate { id: String },
    /// Restart a running session in place
    Restart { id: String },
    /// Run code on a session's main kernel
    Exec(session::ExecArgs),
    /// Interrupt the current run
    Interrupt {
        id: String,
        #[arg(long, default_value = "run-0")]
        run_id: String,
    },
    /// Show the pending queue of a resource group
    ShowQueue { group: String },
    /// Drain an agent (it finishes its kernels but gets no new ones)
    DrainAgent {
        agent_id: String,
        /// Put the agent back into rotation instead
        #[arg(long)]
        undrain: bool,
    },
    /// Validate accounting totals against the journal
    RecalcUsage,
    /// Ask a group's agents to re-sync their image catalogs
    RescanImages { group: String },
    /// Manage the berth daemon
    Daemon {
        #[command(subcommand)]
        command: daemon::DaemonCommands,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), client::ClientError> {
    let output = cli.output;
    match cli.command {
        Commands::Enqueue(args) => session::enqueue(args, output).await,
        Commands::Sessions(args) => session::sessions(args, output).await,
        Commands::Query { id } => session::query(&id, output).await,
        Commands::Cancel { id } => session::cancel(&id, output).await,
        Commands::Destroy { id } => session::destroy(&id, false, output).await,
        Commands::ForceTerminate { id } => session::destroy(&id, true, output).await,
        Commands::Restart { id } => session::restart(&id, output).await,
        Commands::Exec(args) => session::exec(args, output).await,
        Commands::Interrupt { id, run_id } => session::interrupt(&id, &run_id).await,
        Commands::ShowQueue { group } => admin::show_queue(&group, output).await,
        Commands::DrainAgent { agent_id, undrain } => {
            admin::drain_agent(&agent_id, !undrain).await
        }
        Commands::RecalcUsage => admin::recalc_usage(output).await,
        Commands::RescanImages { group } => admin::rescan_images(&group).await,
        Commands::Daemon { command } => daemon::run(command, output).await,
    }
}
