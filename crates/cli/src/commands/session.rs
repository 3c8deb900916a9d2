// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session commands: enqueue, list, query, and lifecycle actions.

use crate::client::{ClientError, DaemonClient};
use crate::output::{self, OutputFormat};
use berth_config::parse_duration;
use berth_core::{ClusterMode, Owner, ResourceGroupId, SessionId, SessionKind, SlotName};
use berth_daemon::protocol::{Request, Response};
use berth_rpc::ExecMode;
use berth_sched::EnqueueRequest;
use clap::Args;
use indexmap::IndexMap;
use std::collections::HashMap;

/// Arguments for `berth enqueue`.
#[derive(Debug, Args)]
pub struct EnqueueArgs {
    /// Session name (unique among your live sessions)
    #[arg(long)]
    pub name: String,

    /// Owner access key
    #[arg(long = "access-key")]
    pub access_key: String,

    /// Owner user name (defaults to the access key)
    #[arg(long)]
    pub user: Option<String>,

    /// Owner group
    #[arg(long = "owner-group", default_value = "default")]
    pub owner_group: String,

    /// Owner domain
    #[arg(long, default_value = "default")]
    pub domain: String,

    /// Target resource group
    #[arg(long = "group", default_value = "default")]
    pub resource_group: String,

    /// Per-kernel slot request as name=value (repeatable), e.g. -s cpu=2 -s mem=4G
    #[arg(short = 's', long = "slot", value_name = "NAME=VALUE")]
    pub slots: Vec<String>,

    /// Container image reference
    #[arg(long)]
    pub image: String,

    /// CPU architecture of the image
    #[arg(long, default_value = "x86_64")]
    pub arch: String,

    /// Number of kernels in the session
    #[arg(long = "cluster-size", default_value_t = 1)]
    pub cluster_size: u32,

    /// Spread kernels over multiple agents
    #[arg(long = "multi-node")]
    pub multi_node: bool,

    /// Session type
    #[arg(long = "type", value_enum, default_value_t = SessionTypeArg::Interactive)]
    pub session_type: SessionTypeArg,

    /// Batch: sessions that must succeed first (repeatable)
    #[arg(long = "depends-on")]
    pub depends_on: Vec<String>,

    /// Batch: earliest start time, epoch milliseconds
    #[arg(long = "starts-at-ms")]
    pub starts_at_ms: Option<u64>,

    /// Inference: replica count
    #[arg(long, default_value_t = 1)]
    pub replicas: u32,

    /// Priority (higher runs earlier under the priority policy)
    #[arg(long, default_value_t = 0)]
    pub priority: i32,

    /// Environment variables as KEY=VALUE (repeatable)
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    pub environ: Vec<String>,

    /// Bootstrap script to run at container start
    #[arg(long = "bootstrap")]
    pub bootstrap_script: Option<String>,

    /// Virtual folder mounts (repeatable, opaque references)
    #[arg(long = "mount")]
    pub mounts: Vec<String>,

    /// Hard lifetime cap, e.g. "6h"
    #[arg(long = "max-lifetime")]
    pub max_lifetime: Option<String>,

    /// Idle timeout override for interactive sessions, e.g. "30m"
    #[arg(long = "idle-timeout")]
    pub idle_timeout: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SessionTypeArg {
    Interactive,
    Batch,
    Inference,
    System,
}

impl std::fmt::Display for SessionTypeArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SessionTypeArg::Interactive => "interactive",
            SessionTypeArg::Batch => "batch",
            SessionTypeArg::Inference => "inference",
            SessionTypeArg::System => "system",
        })
    }
}

/// Arguments for `berth sessions`.
#[derive(Debug, Args)]
pub struct MatchArgs {
    /// Filter by status name, e.g. "running"
    #[arg(long)]
    pub status: Option<String>,

    /// Filter by owner access key
    #[arg(long = "access-key")]
    pub access_key: Option<String>,

    /// Filter by name substring
    #[arg(long = "name")]
    pub name_contains: Option<String>,
}

/// Arguments for `berth exec`.
#[derive(Debug, Args)]
pub struct ExecArgs {
    pub id: String,
    pub code: String,

    #[arg(long, value_enum, default_value_t = ExecModeArg::Query)]
    pub mode: ExecModeArg,

    #[arg(long = "run-id", default_value = "run-0")]
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExecModeArg {
    Query,
    Batch,
}

impl std::fmt::Display for ExecModeArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ExecModeArg::Query => "query",
            ExecModeArg::Batch => "batch",
        })
    }
}

fn parse_pairs(pairs: &[String], what: &str) -> Result<Vec<(String, String)>, ClientError> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| ClientError::Daemon {
                    code: berth_daemon::protocol::ErrorCode::BadRequest,
                    message: format!("{what} '{pair}' is not NAME=VALUE"),
                })
        })
        .collect()
}

fn build_request(args: EnqueueArgs) -> Result<EnqueueRequest, ClientError> {
    let slots: IndexMap<SlotName, String> = parse_pairs(&args.slots, "slot")?
        .into_iter()
        .map(|(k, v)| (SlotName::new(k), v))
        .collect();
    let environ: HashMap<String, String> =
        parse_pairs(&args.environ, "env")?.into_iter().collect();

    let bad = |message: String| ClientError::Daemon {
        code: berth_daemon::protocol::ErrorCode::BadRequest,
        message,
    };

    let idle_timeout_ms = args
        .idle_timeout
        .as_deref()
        .map(|v| parse_duration(v).map(|d| d.as_millis() as u64))
        .transpose()
        .map_err(|e| bad(format!("bad --idle-timeout: {e}")))?;
    let max_lifetime_ms = args
        .max_lifetime
        .as_deref()
        .map(|v| parse_duration(v).map(|d| d.as_millis() as u64))
        .transpose()
        .map_err(|e| bad(format!("bad --max-lifetime: {e}")))?;

    let kind = match args.session_type {
        SessionTypeArg::Interactive => SessionKind::Interactive { idle_timeout_ms },
        SessionTypeArg::Batch => SessionKind::Batch {
            dependencies: args.depends_on.iter().map(|d| SessionId::new(d.as_str())).collect(),
            starts_at_ms: args.starts_at_ms,
        },
        SessionTypeArg::Inference => SessionKind::Inference {
            replicas: args.replicas,
        },
        SessionTypeArg::System => SessionKind::System,
    };

    Ok(EnqueueRequest {
        name: args.name,
        owner: Owner {
            user: args.user.unwrap_or_else(|| args.access_key.clone()),
            access_key: args.access_key,
            group: args.owner_group,
            domain: args.domain,
        },
        resource_group: ResourceGroupId::new(args.resource_group),
        slots,
        image: args.image,
        architecture: args.arch,
        cluster_mode: if args.multi_node {
            ClusterMode::MultiNode
        } else {
            ClusterMode::SingleNode
        },
        cluster_size: args.cluster_size,
        kind,
        priority: args.priority,
        environ,
        bootstrap_script: args.bootstrap_script,
        mounts: args.mounts,
        max_lifetime_ms,
    })
}

pub async fn enqueue(args: EnqueueArgs, output: OutputFormat) -> Result<(), ClientError> {
    let request = build_request(args)?;
    let client = DaemonClient::new()?;
    match client.request(Request::Enqueue { request }).await? {
        Response::Receipt { receipt } => {
            match output {
                OutputFormat::Json => output::print_json(&receipt),
                OutputFormat::Text => {
                    println!("{} {} (seq {})", receipt.session_id, receipt.status, receipt.seq)
                }
            }
            Ok(())
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}

pub async fn sessions(args: MatchArgs, output: OutputFormat) -> Result<(), ClientError> {
    let status = args
        .status
        .as_deref()
        .map(|name| {
            berth_config::status_from_name(name).ok_or_else(|| ClientError::Daemon {
                code: berth_daemon::protocol::ErrorCode::BadRequest,
                message: format!("unknown status '{name}'"),
            })
        })
        .transpose()?;

    let client = DaemonClient::new()?;
    let response = client
        .request(Request::Match {
            status,
            access_key: args.access_key,
            name_contains: args.name_contains,
        })
        .await?;

    match response {
        Response::Sessions { sessions } => {
            match output {
                OutputFormat::Json => output::print_json(&sessions),
                OutputFormat::Text => {
                    println!("{}", output::session_header());
                    for q in &sessions {
                        println!("{}", output::session_row(q));
                    }
                }
            }
            Ok(())
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}

pub async fn query(id: &str, output: OutputFormat) -> Result<(), ClientError> {
    let client = DaemonClient::new()?;
    match client.request(Request::Query { id: id.to_string() }).await? {
        Response::Session { session } => {
            match output {
                OutputFormat::Json => output::print_json(&session),
                OutputFormat::Text => print!("{}", output::session_detail(&session)),
            }
            Ok(())
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}

async fn receipt_command(
    request: Request,
    output: OutputFormat,
) -> Result<(), ClientError> {
    let client = DaemonClient::new()?;
    match client.request(request).await? {
        Response::Receipt { receipt } => {
            match output {
                OutputFormat::Json => output::print_json(&receipt),
                OutputFormat::Text => println!("{} {}", receipt.session_id, receipt.status),
            }
            Ok(())
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}

pub async fn cancel(id: &str, output: OutputFormat) -> Result<(), ClientError> {
    receipt_command(Request::Cancel { id: id.to_string() }, output).await
}

pub async fn destroy(id: &str, forced: bool, output: OutputFormat) -> Result<(), ClientError> {
    receipt_command(
        Request::Destroy {
            id: id.to_string(),
            forced,
        },
        output,
    )
    .await
}

pub async fn restart(id: &str, output: OutputFormat) -> Result<(), ClientError> {
    receipt_command(Request::Restart { id: id.to_string() }, output).await
}

pub async fn exec(args: ExecArgs, output: OutputFormat) -> Result<(), ClientError> {
    let mode = match args.mode {
        ExecModeArg::Query => ExecMode::Query,
        ExecModeArg::Batch => ExecMode::Batch,
    };
    let client = DaemonClient::new()?;
    match client
        .request(Request::Exec {
            id: args.id,
            run_id: args.run_id,
            mode,
            code: args.code,
        })
        .await?
    {
        Response::Exec { output: exec_output } => {
            match output {
                OutputFormat::Json => output::print_json(&exec_output),
                OutputFormat::Text => {
                    if !exec_output.stdout.is_empty() {
                        print!("{}", exec_output.stdout);
                        if !exec_output.stdout.ends_with('\n') {
                            println!();
                        }
                    }
                    if !exec_output.stderr.is_empty() {
                        eprint!("{}", exec_output.stderr);
                    }
                }
            }
            Ok(())
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}

pub async fn interrupt(id: &str, run_id: &str) -> Result<(), ClientError> {
    let client = DaemonClient::new()?;
    match client
        .request(Request::Interrupt {
            id: id.to_string(),
            run_id: run_id.to_string(),
        })
        .await?
    {
        Response::Ok => {
            println!("interrupted");
            Ok(())
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
