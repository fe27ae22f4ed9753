//! Plugin commands (plugin list, run)

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use tokio_util::sync::CancellationToken;

use super::output::Output;
use crate::dispatch::{InvocationResult, Outcome};
use crate::plugin::{builtins, LoadOptions, PluginRegistry};
use crate::session::Session;
use crate::storage::Workspace;
use crate::sync::OfflineRemote;

#[derive(Subcommand)]
pub enum PluginCommands {
    /// List loaded plugins and their capabilities
    List,
}

pub async fn run(cmd: PluginCommands, output: &Output) -> Result<()> {
    match cmd {
        PluginCommands::List => list_plugins(output).await,
    }
}

/// Prints one line per invocation, failures included
pub(super) fn print_results(results: &[InvocationResult]) {
    for result in results {
        match &result.outcome {
            Outcome::Success { message, .. } => match message {
                Some(message) => println!("[{}] {}", result.plugin, message),
                None => println!("[{}] ok ({})", result.plugin, result.target),
            },
            Outcome::Failure { class, message } => {
                println!(
                    "[{}] FAILED {} on {}: {}",
                    result.plugin, class, result.target, message
                );
            }
        }
    }
}

async fn list_plugins(output: &Output) -> Result<()> {
    let (registry, searched) = match Workspace::open_current() {
        Ok(workspace) => {
            let config = &workspace.config().project;
            let options = LoadOptions {
                dirs: workspace.plugin_dirs(),
                disabled: config.plugins.disabled.clone(),
                search_path: config.plugins.search_path,
                ..LoadOptions::from(&config.dispatch)
            };
            let registry = PluginRegistry::load_all(builtins(), &options).await?;
            (registry, options.dirs)
        }
        // Outside a workspace only the built-ins and PATH are available
        Err(_) => {
            let options = LoadOptions {
                search_path: true,
                ..LoadOptions::default()
            };
            (PluginRegistry::load_all(builtins(), &options).await?, Vec::new())
        }
    };

    if output.is_json() {
        let plugins: Vec<_> = registry
            .plugins()
            .iter()
            .map(|p| p.descriptor())
            .collect();
        let warnings: Vec<_> = registry
            .warnings()
            .iter()
            .map(|w| serde_json::json!({"plugin": w.plugin, "reason": w.reason}))
            .collect();
        output.data(&serde_json::json!({
            "plugins": plugins,
            "warnings": warnings,
        }));
        return Ok(());
    }

    println!("{:<20} {:<10} CAPABILITIES", "NAME", "VERSION");
    println!("{}", "-".repeat(70));
    for plugin in registry.plugins() {
        let descriptor = plugin.descriptor();
        let capabilities: Vec<String> = descriptor
            .capabilities
            .iter()
            .map(|c| c.to_string())
            .collect();
        println!(
            "{:<20} {:<10} {}",
            descriptor.name,
            descriptor.version,
            capabilities.join(", ")
        );
    }

    if !registry.warnings().is_empty() {
        println!();
        println!("Not loaded:");
        for warning in registry.warnings() {
            println!("  {}: {}", warning.plugin, warning.reason);
        }
    }

    if !searched.is_empty() {
        println!();
        println!("External plugins (tandem-plugin-*) are discovered from:");
        for dir in searched {
            println!("  - {}", dir.display());
        }
        println!("  - PATH");
    }

    Ok(())
}

/// `tandem run <command> [args...]`
pub async fn run_command(output: &Output, name: &str, args: Vec<String>) -> Result<()> {
    let workspace = Workspace::open_current()?;
    let session = Session::open(&workspace, Arc::new(OfflineRemote)).await?;

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let report = session
        .run_command(name, args, &cancel)
        .await
        .with_context(|| format!("Failed to run '{}'", name));
    ctrl_c.abort();
    let report = report?;

    if output.is_json() {
        output.data(&serde_json::json!({
            "result": report.result,
            "queued": report.queued.len(),
            "rejected": report.rejected.iter().map(|r| r.reason.clone()).collect::<Vec<_>>(),
        }));
    } else {
        match &report.result.outcome {
            Outcome::Success {
                message, output: data, ..
            } => match message {
                Some(message) => println!("{}", message),
                None if !data.is_null() => {
                    println!("{}", serde_json::to_string_pretty(data)?)
                }
                None => {}
            },
            Outcome::Failure { .. } => print_results(std::slice::from_ref(&report.result)),
        }
        if !report.queued.is_empty() {
            println!(
                "Queued {} change(s) (run 'tandem sync' to push)",
                report.queued.len()
            );
        }
        for rejected in &report.rejected {
            println!("Rejected change: {}", rejected.reason);
        }
    }

    if let Outcome::Failure { class, message } = &report.result.outcome {
        anyhow::bail!("Command '{}' failed ({}): {}", name, class, message);
    }

    Ok(())
}
