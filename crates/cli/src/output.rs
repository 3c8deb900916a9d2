// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Output rendering for the CLI.

use berth_core::ShortId;
use berth_sched::SessionQuery;
use clap::ValueEnum;

/// How command results are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
        })
    }
}

/// Print any serializable value as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("error: failed to render JSON: {e}"),
    }
}

/// One session as a table row: id, name, owner, status, kernels.
pub fn session_row(q: &SessionQuery) -> String {
    format!(
        "{:<14} {:<20} {:<16} {:<18} {}",
        q.session.id.short(12),
        q.session.spec.name,
        q.session.spec.owner.access_key.short(14),
        q.session.status.to_string(),
        q.kernels.len(),
    )
}

pub fn session_header() -> String {
    format!(
        "{:<14} {:<20} {:<16} {:<18} {}",
        "ID", "NAME", "OWNER", "STATUS", "KERNELS"
    )
}

/// Long-form view of one session.
pub fn session_detail(q: &SessionQuery) -> String {
    let mut out = String::new();
    let s = &q.session;
    out.push_str(&format!("id:            {}\n", s.id));
    out.push_str(&format!("name:          {}\n", s.spec.name));
    out.push_str(&format!("owner:         {}\n", s.spec.owner.access_key));
    out.push_str(&format!("group:         {}\n", s.spec.resource_group));
    out.push_str(&format!("status:        {}\n", s.status));
    out.push_str(&format!("result:        {}\n", s.result));
    if let Some(error) = &s.error {
        out.push_str(&format!("error:         {error}\n"));
    }
    out.push_str(&format!("cluster:       {} x {}\n", s.spec.cluster_mode, s.spec.cluster_size));
    out.push_str("kernels:\n");
    for k in &q.kernels {
        let agent = k
            .agent_id
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "  {:<14} {:<6} idx={} {:<12} agent={}\n",
            k.id.short(12),
            k.role.to_string(),
            k.cluster_idx,
            k.status.to_string(),
            agent,
        ));
    }
    out.push_str("history:\n");
    for entry in &q.history {
        let reason = entry
            .reason
            .as_deref()
            .map(|r| format!(" ({r})"))
            .unwrap_or_default();
        out.push_str(&format!("  #{} {}{}\n", entry.seq, entry.status, reason));
    }
    out
}

#[cfg(test)]
#[path = "output_tests.rs"]
mod tests;
