//! Sync commands (sync, status)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::output::Output;
use super::plugin_cmd::print_results;
use crate::domain::EntityKind;
use crate::session::Session;
use crate::storage::Workspace;
use crate::sync::HttpRemote;

/// Cancels `cancel` on Ctrl-C or after `timeout`
fn spawn_watchdog(cancel: CancellationToken, timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; cancelling sync");
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_secs = timeout.as_secs(), "Sync timed out; cancelling");
            }
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    })
}

fn format_time(time: Option<chrono::DateTime<chrono::Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

pub async fn sync(output: &Output, timeout_secs: Option<u64>) -> Result<()> {
    let workspace = Workspace::open_current()?;
    let config = &workspace.config().project;

    let endpoint = config.remote.require_endpoint()?;
    let token = config.remote.token()?;
    let remote = HttpRemote::new(endpoint, &token).context("Failed to create HTTP client")?;

    let _lock = workspace.lock_sync()?;
    let session = Session::open(&workspace, Arc::new(remote)).await?;

    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.sync.timeout());
    let cancel = CancellationToken::new();
    let watchdog = spawn_watchdog(cancel.clone(), timeout);

    info!(endpoint, "Starting sync");
    let report = session.sync(&cancel).await;
    cancel.cancel();
    let _ = watchdog.await;
    let report = report?;

    let last_synced = session.engine().last_synced_at()?;

    if output.is_json() {
        let outcome = match &report.outcome {
            Ok(outcome) => serde_json::json!({
                "success": true,
                "applied": outcome.applied_count,
                "pushed": outcome.pushed_count,
                "discarded": outcome.discarded_count,
                "conflicts": outcome.conflicts.iter().map(|c| serde_json::json!({
                    "entity_id": c.entity_id,
                    "kind": c.kind,
                    "remote_fields": c.remote_fields,
                    "discarded": c.discarded,
                })).collect::<Vec<_>>(),
                "dead_letters": outcome.dead_letters.iter().map(|d| serde_json::json!({
                    "token": d.token,
                    "entity_id": d.entity_id,
                    "kind": d.kind,
                    "op": d.op,
                    "reason": d.reason,
                    "dropped": d.dropped,
                })).collect::<Vec<_>>(),
                "cursor": outcome.cursor.token,
            }),
            Err(e) => serde_json::json!({
                "success": false,
                "class": e.class().as_str(),
                "error": e.label(),
                "message": e.to_string(),
            }),
        };
        output.data(&serde_json::json!({
            "sync": outcome,
            "last_synced_at": last_synced,
            "plugin_results": report.plugin_results,
            "queued": report.queued.len(),
            "rejected": report.rejected.iter().map(|r| serde_json::json!({
                "plugin": r.plugin,
                "reason": r.reason,
            })).collect::<Vec<_>>(),
        }));
    } else {
        if let Ok(outcome) = &report.outcome {
            println!(
                "Synced: {} applied, {} pushed",
                outcome.applied_count, outcome.pushed_count
            );
            for conflict in &outcome.conflicts {
                println!(
                    "Conflict: remote changes to {} {} ({}) replaced {} pending change(s)",
                    conflict.kind,
                    conflict.entity_id,
                    conflict.remote_fields.join(", "),
                    conflict.discarded.len()
                );
            }
            for dead in &outcome.dead_letters {
                println!(
                    "Dropped: remote refused {} of {} {}: {}",
                    dead.op, dead.kind, dead.entity_id, dead.reason
                );
            }
        }

        print_results(report.plugin_results.results());

        if !report.queued.is_empty() {
            println!(
                "Plugins queued {} change(s) for the next sync",
                report.queued.len()
            );
        }
        for rejected in &report.rejected {
            println!("Rejected change from {}: {}", rejected.plugin, rejected.reason);
        }
    }

    if let Err(e) = report.outcome {
        anyhow::bail!(
            "Sync failed ({}, {}): {}. Last successful sync: {}",
            e.class(),
            e.label(),
            e,
            format_time(last_synced)
        );
    }

    Ok(())
}

pub fn status(output: &Output) -> Result<()> {
    let workspace = Workspace::open_current()?;
    let store = workspace.open_store()?;
    let config = &workspace.config().project;

    let cursor = store.cursor()?;
    let pending = store.pending()?;
    let mut counts = Vec::new();
    for kind in EntityKind::ALL {
        counts.push((kind, store.list(Some(kind), false)?.len()));
    }

    if output.is_json() {
        output.data(&serde_json::json!({
            "root": workspace.root().display().to_string(),
            "endpoint": config.remote.endpoint,
            "cursor": cursor.token,
            "last_synced_at": cursor.committed_at,
            "pending": pending.len(),
            "entities": counts
                .iter()
                .map(|(kind, n)| (kind.as_str().to_string(), serde_json::json!(n)))
                .collect::<serde_json::Map<_, _>>(),
        }));
    } else {
        println!("Workspace: {}", workspace.root().display());
        println!(
            "Remote: {}",
            config.remote.endpoint.as_deref().unwrap_or("(not configured)")
        );
        println!("Last sync: {}", format_time(cursor.committed_at));
        println!("Pending changes: {}", pending.len());
        println!();
        println!("{:<10} COUNT", "KIND");
        println!("{}", "-".repeat(20));
        for (kind, n) in counts {
            println!("{:<10} {}", kind, n);
        }
    }

    Ok(())
}
