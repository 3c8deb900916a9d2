// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Operator commands: queue inspection, draining, accounting validation.

use crate::client::{ClientError, DaemonClient};
use crate::output::{self, OutputFormat};
use berth_core::ResourceGroupId;
use berth_daemon::protocol::{Request, Response};

pub async fn show_queue(group: &str, output: OutputFormat) -> Result<(), ClientError> {
    let client = DaemonClient::new()?;
    match client
        .request(Request::ShowQueue {
            group: ResourceGroupId::new(group),
        })
        .await?
    {
        Response::Queue { entries } => {
            match output {
                OutputFormat::Json => output::print_json(&entries),
                OutputFormat::Text => {
                    println!("{} RETRIES", output::session_header());
                    for entry in &entries {
                        println!("{} {}", output::session_row(&entry.entry), entry.retries);
                    }
                }
            }
            Ok(())
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}

pub async fn drain_agent(agent_id: &str, drain: bool) -> Result<(), ClientError> {
    let client = DaemonClient::new()?;
    match client
        .request(Request::DrainAgent {
            agent_id: agent_id.to_string(),
            drain,
        })
        .await?
    {
        Response::Ok => {
            println!(
                "agent {agent_id} {}",
                if drain { "draining" } else { "back in rotation" }
            );
            Ok(())
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}

pub async fn recalc_usage(output: OutputFormat) -> Result<(), ClientError> {
    let client = DaemonClient::new()?;
    match client.request(Request::RecalcUsage).await? {
        Response::Recalc { drift } => {
            match output {
                OutputFormat::Json => output::print_json(&drift),
                OutputFormat::Text => {
                    if drift.is_empty() {
                        println!("usage totals match the journal");
                    } else {
                        println!("drift detected and rewritten:");
                        for line in &drift {
                            println!("  {line}");
                        }
                    }
                }
            }
            Ok(())
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}

pub async fn rescan_images(group: &str) -> Result<(), ClientError> {
    let client = DaemonClient::new()?;
    match client
        .request(Request::RescanImages {
            group: ResourceGroupId::new(group),
        })
        .await?
    {
        Response::Rescan { synced } => {
            println!("{synced} agent(s) re-synced");
            Ok(())
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}
