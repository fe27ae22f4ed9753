//! Main CLI application structure

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use super::output::{Output, OutputFormat};
use super::{entity, plugin_cmd, sync_cmd};
use crate::domain::EntityKind;
use crate::storage::{Config, Workspace};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(author, version, about = "Sync a hosted task service locally and extend it with plugins")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format (defaults to the global config, then text)
    #[arg(long, short = 'f', global = true)]
    pub format: Option<OutputFormat>,

    /// Enable debug logging on stderr
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new tandem workspace
    Init {
        /// Path to initialize (defaults to current directory)
        #[arg(default_value = ".")]
        path: String,

        /// Base URL of the service API
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Pull remote changes, push local ones, then run plugin subscribers
    Sync {
        /// Give up after this many seconds (defaults to [sync] timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show workspace and sync status
    Status,

    /// List entities in the local store
    List {
        /// Only this kind (item, project, section, label, filter, note)
        #[arg(long, short)]
        kind: Option<EntityKind>,

        /// Include deleted entities
        #[arg(long)]
        deleted: bool,
    },

    /// Show one entity
    Show {
        /// Entity ID
        id: String,
    },

    /// Queue creation of an entity
    ///
    /// Examples:
    ///   tandem add item -s content="Buy milk" -s priority=4
    ///   tandem add project -s name=Home
    Add {
        /// Entity kind
        kind: EntityKind,

        /// Field to set (key=value)
        #[arg(long = "set", short = 's', value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Queue changes to an entity
    Edit {
        /// Entity ID
        id: String,

        /// Field to set (key=value)
        #[arg(long = "set", short = 's', value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Queue deletion of an entity
    Delete {
        /// Entity ID
        id: String,
    },

    /// Run a plugin command
    Run {
        /// Command name
        command: String,

        /// Arguments passed to the plugin
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Manage plugins
    #[command(subcommand)]
    Plugin(plugin_cmd::PluginCommands),
}

/// Installs the stderr log subscriber
///
/// `RUST_LOG` wins when set; otherwise warnings only, or debug for this
/// crate with `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "warn,tandem_cli=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Main entry point for the CLI
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let format = match cli.format {
        Some(format) => format,
        None => Config::global_only()
            .map(|c| c.global.default_format.into())
            .unwrap_or_default(),
    };
    let output = Output::new(format);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(execute(cli.command, &output))
}

async fn execute(command: Commands, output: &Output) -> Result<()> {
    match command {
        Commands::Init { path, endpoint } => {
            let workspace = Workspace::init(&path, endpoint.as_deref())?;
            tracing::debug!(dir = %workspace.dir().display(), "Created workspace");
            output.success(&format!(
                "Initialized tandem workspace at {}",
                workspace.root().display()
            ));
            Ok(())
        }

        Commands::Sync { timeout } => sync_cmd::sync(output, timeout).await,
        Commands::Status => sync_cmd::status(output),

        Commands::List { kind, deleted } => entity::list(output, kind, deleted),
        Commands::Show { id } => entity::show(output, &id),
        Commands::Add { kind, set } => entity::add(output, kind, &set),
        Commands::Edit { id, set } => entity::edit(output, &id, &set),
        Commands::Delete { id } => entity::delete(output, &id),

        Commands::Run { command, args } => plugin_cmd::run_command(output, &command, args).await,
        Commands::Plugin(cmd) => plugin_cmd::run(cmd, output).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_collects_trailing_args() {
        let cli = Cli::parse_from(["tandem", "run", "summary", "--today", "x"]);
        match cli.command {
            Commands::Run { command, args } => {
                assert_eq!(command, "summary");
                assert_eq!(args, vec!["--today", "x"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn add_parses_kind_and_fields() {
        let cli = Cli::parse_from(["tandem", "--format", "json", "add", "item", "-s", "content=a"]);
        assert_eq!(cli.format, Some(OutputFormat::Json));
        match cli.command {
            Commands::Add { kind, set } => {
                assert_eq!(kind, EntityKind::Item);
                assert_eq!(set, vec!["content=a"]);
            }
            _ => panic!("expected add"),
        }
    }
}
