//! Workspace management
//!
//! Handles workspace initialization and provides access to the local store
//! and the cross-process sync lock.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use thiserror::Error;

use super::{Config, LocalStore};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Not in a tandem workspace. Run 'tandem init' first.")]
    NotInWorkspace,

    #[error("Another tandem process is syncing this workspace")]
    SyncInProgress,
}

/// Exclusive hold on `.tandem/sync.lock`, released on drop
#[derive(Debug)]
pub struct SyncLock {
    file: File,
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// A tandem workspace (a directory containing `.tandem/`)
pub struct Workspace {
    root: PathBuf,
    config: Config,
}

impl Workspace {
    /// Opens an existing workspace at the given path
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        if !root.join(Config::DIR_NAME).is_dir() {
            return Err(WorkspaceError::NotInWorkspace.into());
        }

        let config = Config::for_project(&root)?;

        Ok(Self { root, config })
    }

    /// Opens the workspace at the current directory or a parent
    pub fn open_current() -> Result<Self> {
        let root = Config::find_project_root().ok_or(WorkspaceError::NotInWorkspace)?;

        Self::open(root)
    }

    /// Initializes a new workspace at the given path
    ///
    /// Existing files are left alone, so running it twice is harmless.
    pub fn init(root: impl Into<PathBuf>, endpoint: Option<&str>) -> Result<Self> {
        let root = root.into();
        let dir = root.join(Config::DIR_NAME);

        let plugins_dir = dir.join("plugins");
        fs::create_dir_all(&plugins_dir).with_context(|| {
            format!(
                "Failed to create plugins directory: {}",
                plugins_dir.display()
            )
        })?;

        let config_path = dir.join("config.toml");
        if !config_path.exists() {
            let endpoint_line = match endpoint {
                Some(url) => format!("endpoint = \"{}\"", url),
                None => "# endpoint = \"https://api.example.com/sync/v9\"".to_string(),
            };
            let default_config = format!(
                r#"# tandem workspace configuration

[remote]
{}
# Environment variable holding the API token
token_env = "TANDEM_API_TOKEN"

[sync]
max_attempts = 5
base_backoff_ms = 200
max_backoff_ms = 10000
timeout_secs = 120

[dispatch]
handler_timeout_ms = 5000
init_timeout_ms = 5000
workers = 8

[plugins]
# Extra directories searched for tandem-plugin-* executables
dirs = []
disabled = []
search_path = true
"#,
                endpoint_line
            );
            fs::write(&config_path, default_config)
                .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
        }

        let gitignore_path = dir.join(".gitignore");
        if !gitignore_path.exists() {
            let gitignore = r#"# Local mirror of remote state
store.db
store.db-wal
store.db-shm

# Sync lock
sync.lock
"#;
            fs::write(&gitignore_path, gitignore).with_context(|| {
                format!("Failed to write .gitignore: {}", gitignore_path.display())
            })?;
        }

        let workspace = Self::open(root)?;

        // Create the store up front so schema problems show at init time
        workspace.open_store()?;

        Ok(workspace)
    }

    /// Returns the workspace root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the .tandem directory path
    pub fn dir(&self) -> PathBuf {
        self.root.join(Config::DIR_NAME)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store_path(&self) -> PathBuf {
        self.dir().join("store.db")
    }

    /// Returns the workspace plugins directory
    pub fn plugins_dir(&self) -> PathBuf {
        self.dir().join("plugins")
    }

    /// All directories searched for external plugins
    ///
    /// Relative entries in `[plugins] dirs` are resolved against the workspace root.
    pub fn plugin_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.plugins_dir()];
        for dir in &self.config.project.plugins.dirs {
            if dir.is_absolute() {
                dirs.push(dir.clone());
            } else {
                dirs.push(self.root.join(dir));
            }
        }
        dirs
    }

    /// Opens the local store for this workspace
    pub fn open_store(&self) -> Result<LocalStore> {
        let path = self.store_path();
        LocalStore::open(&path)
            .with_context(|| format!("Failed to open local store: {}", path.display()))
    }

    /// Takes the cross-process sync lock without waiting
    pub fn lock_sync(&self) -> Result<SyncLock> {
        let path = self.dir().join("sync.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open sync lock: {}", path.display()))?;

        file.try_lock_exclusive()
            .map_err(|_| WorkspaceError::SyncInProgress)?;

        Ok(SyncLock { file })
    }
}
