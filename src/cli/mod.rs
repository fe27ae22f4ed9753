//! # Command-Line Interface
//!
//! User-facing CLI commands and output formatting.
//!
//! ## Command Groups
//!
//! | Group | Purpose | Examples |
//! |-------|---------|----------|
//! | Core | Workspace and sync | `init`, `sync`, `status` |
//! | Entities | Read the mirror, queue changes | `list`, `show`, `add`, `edit`, `delete` |
//! | Plugins | Commands and discovery | `run summary`, `plugin list` |
//!
//! ## Output Formats
//!
//! All commands support `--format` flag:
//! - `text` (default) - Human-readable output
//! - `json` - Machine-parseable JSON
//!
//! ## Logging
//!
//! Logs go to stderr. Use `--verbose` (or `-v`) for debug output, or set
//! `RUST_LOG` for full control:
//! ```bash
//! RUST_LOG=tandem_cli::sync=debug tandem sync
//! ```
//!
//! ## Entry Point
//!
//! Call [`run()`] to parse arguments and execute the appropriate command.

mod app;
mod entity;
mod output;
mod plugin_cmd;
mod sync_cmd;

pub use app::{run, Cli, Commands};
pub use output::{Output, OutputFormat};
