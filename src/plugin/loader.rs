//! External plugin discovery and loading
//!
//! Plugins are discovered from:
//! 1. The workspace plugin directories (`.tandem/plugins/` plus `[plugins] dirs`)
//! 2. PATH, when enabled
//!
//! Any executable whose file name starts with `tandem-plugin-` is a
//! candidate. The first one found for a given file name wins.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::bus::ChangeEvent;
use crate::storage::Snapshot;

use super::capability::{
    CommandInvocation, HandlerError, HandlerOutput, Plugin, PluginDescriptor, PluginInitError,
};
use super::protocol::{PluginManifest, PluginRequest, PluginResponse};

/// File name prefix of external plugin executables
pub const PLUGIN_PREFIX: &str = "tandem-plugin-";

/// A discovered, not yet loaded, plugin executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    /// File name without the prefix
    pub name: String,

    pub path: PathBuf,
}

/// Scans directories for plugin executables
#[derive(Debug, Clone, Default)]
pub struct PluginLoader {
    plugin_dirs: Vec<PathBuf>,
    search_path: bool,
}

impl PluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plugin directory to search
    pub fn add_plugin_dir(&mut self, dir: impl Into<PathBuf>) {
        self.plugin_dirs.push(dir.into());
    }

    /// Also search PATH after the plugin directories
    pub fn with_path_search(mut self, enabled: bool) -> Self {
        self.search_path = enabled;
        self
    }

    /// Finds every plugin executable
    ///
    /// A plugin directory that does not exist is skipped. One that exists
    /// but cannot be read is an error; unreadable PATH entries are ignored.
    pub fn discover(&self) -> io::Result<Vec<PluginInfo>> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();

        for dir in &self.plugin_dirs {
            if !dir.exists() {
                continue;
            }
            if !dir.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is not a directory", dir.display()),
                ));
            }
            scan_directory(dir, &mut found, &mut seen)?;
        }

        if self.search_path {
            if let Some(path_var) = std::env::var_os("PATH") {
                for dir in std::env::split_paths(&path_var) {
                    if dir.is_dir() {
                        let _ = scan_directory(&dir, &mut found, &mut seen);
                    }
                }
            }
        }

        Ok(found)
    }
}

fn scan_directory(
    dir: &Path,
    found: &mut Vec<PluginInfo>,
    seen: &mut HashSet<String>,
) -> io::Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .collect();
    entries.sort();

    for path in entries {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(name) = file_name.strip_prefix(PLUGIN_PREFIX) else {
            continue;
        };
        if name.is_empty() || !is_executable(&path) {
            continue;
        }
        if seen.insert(file_name.to_string()) {
            found.push(PluginInfo {
                name: name.to_string(),
                path,
            });
        }
    }

    Ok(())
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = path.metadata() {
            return meta.is_file() && meta.permissions().mode() & 0o111 != 0;
        }
    }

    #[cfg(windows)]
    {
        if let Some(ext) = path.extension() {
            return ext == "exe" || ext == "bat" || ext == "cmd";
        }
    }

    false
}

/// Runs `<plugin> --manifest` and parses its output
pub async fn load_manifest(path: &Path, timeout: Duration) -> Result<PluginManifest, PluginInitError> {
    let manifest_error = |reason: String| PluginInitError::Manifest {
        path: path.display().to_string(),
        reason,
    };

    let run = Command::new(path)
        .arg("--manifest")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| manifest_error("timed out".to_string()))?
        .map_err(|e| manifest_error(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(manifest_error(format!(
            "exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    serde_json::from_slice(&output.stdout).map_err(|e| manifest_error(e.to_string()))
}

/// A plugin backed by an executable, spawned once per call
#[derive(Debug, Clone)]
pub struct ExternalPlugin {
    path: PathBuf,
    descriptor: PluginDescriptor,
}

impl ExternalPlugin {
    pub fn new(path: impl Into<PathBuf>, descriptor: PluginDescriptor) -> Self {
        Self {
            path: path.into(),
            descriptor,
        }
    }

    /// Reads the manifest and builds the plugin from it
    pub async fn load(path: &Path, timeout: Duration) -> Result<Self, PluginInitError> {
        let manifest = load_manifest(path, timeout).await?;
        Ok(Self::new(path, manifest.into_descriptor()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sends one request line and reads one response line
    async fn execute(&self, request: &PluginRequest) -> Result<PluginResponse, HandlerError> {
        debug!(plugin = %self.descriptor.name, operation = %request.operation, "Executing plugin");

        let mut child = Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HandlerError::Failed(format!("failed to spawn {}: {}", self.path.display(), e))
            })?;

        let mut line = serde_json::to_string(request)
            .map_err(|e| HandlerError::Protocol(format!("failed to encode request: {}", e)))?;
        line.push('\n');

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HandlerError::Protocol("plugin stdin unavailable".to_string()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| HandlerError::Failed(format!("failed to write to plugin: {}", e)))?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HandlerError::Protocol("plugin stdout unavailable".to_string()))?;
        let response_line = BufReader::new(stdout)
            .lines()
            .next_line()
            .await
            .map_err(|e| HandlerError::Failed(format!("failed to read plugin response: {}", e)))?
            .ok_or_else(|| HandlerError::Protocol("no response from plugin".to_string()))?;

        let response: PluginResponse = serde_json::from_str(&response_line)
            .map_err(|e| HandlerError::Protocol(format!("invalid response: {}", e)))?;

        let _ = child.wait().await;

        Ok(response)
    }
}

#[async_trait]
impl Plugin for ExternalPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn init(&self) -> Result<(), PluginInitError> {
        let failed = |reason: String| PluginInitError::Failed {
            plugin: self.descriptor.name.clone(),
            reason,
        };

        let response = self
            .execute(&PluginRequest::init())
            .await
            .map_err(|e| failed(e.to_string()))?;
        response.into_output().map(|_| ()).map_err(|e| failed(e.to_string()))
    }

    async fn on_event(
        &self,
        event: &ChangeEvent,
        _snapshot: &Snapshot,
    ) -> Result<HandlerOutput, HandlerError> {
        self.execute(&PluginRequest::event(event)).await?.into_output()
    }

    async fn on_command(
        &self,
        invocation: &CommandInvocation,
        snapshot: &Snapshot,
    ) -> Result<HandlerOutput, HandlerError> {
        self.execute(&PluginRequest::command(invocation, snapshot))
            .await?
            .into_output()
    }
}
