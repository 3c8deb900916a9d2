// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon management: start, stop, status.

use crate::client::{ClientError, DaemonClient};
use crate::output::{self, OutputFormat};
use berth_daemon::protocol::{Request, Response};
use clap::Subcommand;
use std::time::Duration;

#[derive(Debug, Subcommand)]
pub enum DaemonCommands {
    /// Start berthd in the background
    Start,
    /// Ask the daemon to shut down
    Stop,
    /// Show daemon status
    Status,
}

pub async fn run(command: DaemonCommands, output: OutputFormat) -> Result<(), ClientError> {
    match command {
        DaemonCommands::Start => start().await,
        DaemonCommands::Stop => stop().await,
        DaemonCommands::Status => status(output).await,
    }
}

async fn start() -> Result<(), ClientError> {
    let client = DaemonClient::new()?;
    if client.is_alive().await {
        println!("berthd is already running");
        return Ok(());
    }

    // berthd ships next to this binary.
    let berthd = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("berthd")))
        .filter(|p| p.exists())
        .unwrap_or_else(|| "berthd".into());

    let spawned = std::process::Command::new(&berthd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    if let Err(e) = spawned {
        return Err(ClientError::Daemon {
            code: berth_daemon::protocol::ErrorCode::Internal,
            message: format!("failed to spawn {}: {e}", berthd.display()),
        });
    }

    // Wait for the socket to answer.
    for _ in 0..50 {
        if client.is_alive().await {
            println!("berthd started");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Err(ClientError::Daemon {
        code: berth_daemon::protocol::ErrorCode::Internal,
        message: "berthd did not come up within 5s".into(),
    })
}

async fn stop() -> Result<(), ClientError> {
    let client = DaemonClient::new()?;
    match client.request(Request::Shutdown).await? {
        Response::Ok => {
            println!("shutdown requested");
            Ok(())
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}

async fn status(output: OutputFormat) -> Result<(), ClientError> {
    let client = DaemonClient::new()?;
    match client.request(Request::Status).await? {
        Response::Status { status } => {
            match output {
                OutputFormat::Json => output::print_json(&status),
                OutputFormat::Text => {
                    println!("version:        {}", status.version);
                    println!("uptime:         {}s", status.uptime_ms / 1000);
                    println!("sessions:       {}", status.sessions);
                    println!("agents:         {}", status.agents);
                    println!("processed seq:  {}", status.processed_seq);
                }
            }
            Ok(())
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}
