//! Transfer orchestrator: the public surface of the engine.
//!
//! A [`FileTransfer`] is bound to one instance for its whole lifetime and owns
//! that instance's SSH session. Uploads try the relay route first and fall back
//! to scp; downloads always use scp.
//!
//! # Example
//!
//! ```rust,ignore
//! use relaycopy::{Collaborators, FileTransfer, TransferConfig};
//! use relaycopy::remote::FileStatusSource;
//!
//! let config = TransferConfig::from_env();
//! let status = Box::new(FileStatusSource::new("status.json"));
//! let parts = Collaborators::production(&config, status)?;
//! let mut transfer = FileTransfer::new("gpu-1", config, parts);
//!
//! transfer.upload_file(Path::new("clip.mp4"), "/data/in/clip.mp4", 3)?;
//! transfer.download_directory("/data/out", Path::new("./out"), 3)?;
//! ```

pub mod directory;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::TransferConfig;
use crate::connection::{ConnectionManager, SessionState, SshTarget};
use crate::direct::{self, FileCopier, ScpCopier};
use crate::locator::{Endpoint, InstanceLocator};
use crate::relay::{
    GofileHost, LargeFileHost, ManualUrlSource, NoManualUrl, RelayUploader, SmallFileHost,
    TransferShHost,
};
use crate::remote::{
    EXISTS_TOKEN, SecureShell, Ssh2Shell, StatusSource, file_exists_command, has_token, quote,
    remote_parent,
};
use crate::retry::RetryPolicy;

pub use directory::{PackedArchive, pack_directory};

/// Errors that can occur while moving files to or from an instance.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("SSH_PRIVATE_KEY_PATH environment variable is required but not set")]
    MissingKeyPath,

    #[error("SSH key file not found at {}", .0.display())]
    KeyNotFound(PathBuf),

    #[error("Could not determine address for instance {0}")]
    InstanceNotFound(String),

    #[error("Instance status unavailable: {0}")]
    Status(String),

    #[error("Failed to establish SSH connection to {endpoint}: {detail}")]
    ConnectionFailed { endpoint: String, detail: String },

    #[error("No active SSH session")]
    NotConnected,

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Copy failed: {0}")]
    Copy(String),

    #[error("Relay host error: {0}")]
    Relay(String),

    #[error("Remote fetch failed: {0}")]
    RemoteFetch(String),

    #[error("Failed to transfer {what} after {attempts} attempts")]
    RetriesExhausted { what: String, attempts: u32 },

    #[error(
        "{} is {size_mb} MB, too large for relay hosts; provide a public download URL",
        .path.display()
    )]
    TooLargeForRelay { path: PathBuf, size_mb: u64 },

    #[error("Local file not found: {}", .0.display())]
    LocalNotFound(PathBuf),

    #[error("Local directory not found: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Remote file not found: {0}")]
    RemoteNotFound(String),

    #[error("Failed to archive directory: {0}")]
    Archive(String),

    #[error("Failed to extract archive on instance: {0}")]
    Extract(String),

    #[error("Remote directory not found or empty: {0}")]
    RemoteListing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The external systems a [`FileTransfer`] talks to.
pub struct Collaborators {
    pub status: Box<dyn StatusSource>,
    pub shell: Box<dyn SecureShell>,
    pub copier: Box<dyn FileCopier>,
    pub small_host: Box<dyn SmallFileHost>,
    pub large_host: Box<dyn LargeFileHost>,
    pub manual_url: Box<dyn ManualUrlSource>,
}

impl Collaborators {
    /// libssh2 session, `scp`, and the public relay hosts from `config`.
    pub fn production(
        config: &TransferConfig,
        status: Box<dyn StatusSource>,
    ) -> crate::Result<Self> {
        Ok(Self {
            status,
            shell: Box::new(Ssh2Shell::new()),
            copier: Box::new(ScpCopier::new()),
            small_host: Box::new(TransferShHost::new(&config.small_relay_url)?),
            large_host: Box::new(GofileHost::new(&config.large_relay_api)?),
            manual_url: Box::new(NoManualUrl),
        })
    }

    pub fn with_manual_url(mut self, source: Box<dyn ManualUrlSource>) -> Self {
        self.manual_url = source;
        self
    }
}

/// Moves files between this machine and one remote instance.
pub struct FileTransfer {
    instance_id: String,
    config: TransferConfig,
    locator: InstanceLocator,
    connection: ConnectionManager,
    copier: Box<dyn FileCopier>,
    relay: RelayUploader,
}

impl FileTransfer {
    /// Bind a handler to `instance_id`. No connection is made until the first
    /// transfer or [`ensure_access`](Self::ensure_access).
    pub fn new(
        instance_id: impl Into<String>,
        config: TransferConfig,
        parts: Collaborators,
    ) -> Self {
        let connection = ConnectionManager::new(parts.shell, &config);
        let relay = RelayUploader::new(
            parts.small_host,
            parts.large_host,
            parts.manual_url,
            config.timeouts,
            config.backoff_step,
        );
        Self {
            instance_id: instance_id.into(),
            locator: InstanceLocator::new(parts.status),
            connection,
            copier: parts.copier,
            relay,
            config,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn session_state(&self) -> SessionState {
        self.connection.state()
    }

    /// Connect to the instance unless already connected.
    pub fn ensure_access(&mut self) -> crate::Result<()> {
        self.connection.ensure_connected(&self.locator, &self.instance_id)
    }

    /// Resolve the instance's SSH endpoint without connecting.
    pub fn resolve_endpoint(&self) -> crate::Result<Endpoint> {
        self.locator
            .resolve(&self.instance_id)?
            .ok_or_else(|| TransferError::InstanceNotFound(self.instance_id.clone()))
    }

    /// Upload a single file, relaying first and falling back to scp.
    pub fn upload_file(
        &mut self,
        local: &Path,
        remote: &str,
        max_retries: u32,
    ) -> crate::Result<()> {
        if !local.is_file() {
            return Err(TransferError::LocalNotFound(local.to_path_buf()));
        }
        self.ensure_access()?;
        if let Some(parent) = remote_parent(remote) {
            self.make_remote_dir(parent)?;
        }
        self.push_with_fallback(local, remote, max_retries)
    }

    /// Download a single file over scp.
    pub fn download_file(
        &mut self,
        remote: &str,
        local: &Path,
        max_retries: u32,
    ) -> crate::Result<()> {
        self.ensure_access()?;
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let check = self.connection.probe(&file_exists_command(remote))?;
        if !has_token(&check, EXISTS_TOKEN) {
            return Err(TransferError::RemoteNotFound(remote.to_string()));
        }

        let target = self.ssh_target()?;
        direct::direct_download(
            self.copier.as_ref(),
            &target,
            remote,
            local,
            self.policy(max_retries),
        )?;
        tracing::info!(remote, local = %local.display(), "download complete");
        Ok(())
    }

    /// Relay `local` to `remote`; on any relay failure, scp it instead with
    /// the full retry budget.
    fn push_with_fallback(
        &self,
        local: &Path,
        remote: &str,
        max_retries: u32,
    ) -> crate::Result<()> {
        match self.relay.upload(&self.connection, local, remote, max_retries) {
            Ok(()) => {
                tracing::info!(local = %local.display(), remote, "upload complete via relay");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(local = %local.display(), error = %e, "relay upload failed, falling back to scp");
            }
        }

        let target = self.ssh_target()?;
        direct::direct_upload(
            self.copier.as_ref(),
            &self.connection,
            &target,
            local,
            remote,
            self.policy(max_retries),
        )?;
        tracing::info!(local = %local.display(), remote, "upload complete via scp");
        Ok(())
    }

    fn make_remote_dir(&self, dir: &str) -> crate::Result<()> {
        let output = self.connection.probe(&format!("mkdir -p {}", quote(dir)))?;
        if !output.trim().is_empty() {
            tracing::warn!(dir, output = %output.trim(), "mkdir reported output");
        }
        Ok(())
    }

    fn ssh_target(&self) -> crate::Result<SshTarget> {
        self.connection.ssh_target(&self.locator, &self.instance_id)
    }

    fn policy(&self, max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, self.config.backoff_step)
    }
}
