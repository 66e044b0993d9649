//! Connection manager: owns the SSH session and its state for one handler.
//!
//! State transitions:
//! ```text
//! Disconnected ──> Connecting ──> Connected
//!                      │
//!                      └──> Disconnected (every username rejected)
//! ```
//!
//! Once `Connected`, [`ConnectionManager::ensure_connected`] is a no-op until
//! the shell reports that the session dropped.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::TransferConfig;
use crate::locator::{Endpoint, InstanceLocator};
use crate::remote::{ConnectRequest, ConnectionInfo, SecureShell};
use crate::{Result, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Everything scp needs to reach the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_path: PathBuf,
}

impl SshTarget {
    /// `user@host:path`
    pub fn remote_spec(&self, remote_path: &str) -> String {
        format!("{}@{}:{}", self.username, self.host, remote_path)
    }
}

pub struct ConnectionManager {
    shell: Box<dyn SecureShell>,
    state: SessionState,
    key_path: Option<PathBuf>,
    key_passphrase: Option<String>,
    usernames: Vec<String>,
    primary_username: String,
    connect_timeout: Duration,
    probe_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(shell: Box<dyn SecureShell>, config: &TransferConfig) -> Self {
        Self {
            shell,
            state: SessionState::Disconnected,
            key_path: config.key_path.clone(),
            key_passphrase: config.key_passphrase.clone(),
            usernames: config.usernames.clone(),
            primary_username: config.primary_username().to_string(),
            connect_timeout: config.timeouts.connect,
            probe_timeout: config.timeouts.probe,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The configured private key, checked to exist on disk.
    pub fn key_path(&self) -> Result<PathBuf> {
        let path = self.key_path.clone().ok_or(TransferError::MissingKeyPath)?;
        if !path.exists() {
            return Err(TransferError::KeyNotFound(path));
        }
        Ok(path)
    }

    /// Make sure an authenticated session to `instance_id` exists.
    pub fn ensure_connected(
        &mut self,
        locator: &InstanceLocator,
        instance_id: &str,
    ) -> Result<()> {
        if self.state == SessionState::Connected {
            if self.shell.is_connected() {
                tracing::debug!(instance_id, "ssh session already active");
                return Ok(());
            }
            tracing::warn!(instance_id, "ssh session dropped, reconnecting");
            self.state = SessionState::Disconnected;
        }

        let key_path = self.key_path()?;
        let endpoint = locator
            .resolve(instance_id)?
            .ok_or_else(|| TransferError::InstanceNotFound(instance_id.to_string()))?;

        self.state = SessionState::Connecting;
        match self.try_usernames(&endpoint, key_path) {
            Ok(info) => {
                tracing::info!(instance_id, session = %info, "ssh connection established");
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    fn try_usernames(&mut self, endpoint: &Endpoint, key_path: PathBuf) -> Result<ConnectionInfo> {
        let mut last_failure = String::from("no usernames configured");
        for username in &self.usernames {
            tracing::info!(endpoint = %endpoint, username = %username, "connecting");
            let request = ConnectRequest {
                host: endpoint.host.clone(),
                port: endpoint.port,
                username: username.clone(),
                key_path: key_path.clone(),
                key_passphrase: self.key_passphrase.clone(),
                timeout: self.connect_timeout,
            };
            match self.shell.connect(&request) {
                Ok(()) => {
                    return Ok(self.shell.connection_info().unwrap_or(ConnectionInfo {
                        host: request.host,
                        username: request.username,
                        port: request.port,
                    }));
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, username = %username, error = %e, "connection attempt rejected");
                    last_failure = e.to_string();
                }
            }
        }

        Err(TransferError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            detail: last_failure,
        })
    }

    /// Where scp should connect.
    ///
    /// Prefers the live session's details; without one, resolves the
    /// instance again and assumes the primary username.
    pub fn ssh_target(&self, locator: &InstanceLocator, instance_id: &str) -> Result<SshTarget> {
        let key_path = self.key_path()?;
        if self.shell.is_connected()
            && let Some(info) = self.shell.connection_info()
        {
            return Ok(SshTarget {
                host: info.host,
                port: info.port,
                username: info.username,
                key_path,
            });
        }

        let endpoint = locator
            .resolve(instance_id)?
            .ok_or_else(|| TransferError::InstanceNotFound(instance_id.to_string()))?;
        Ok(SshTarget {
            host: endpoint.host,
            port: endpoint.port,
            username: self.primary_username.clone(),
            key_path,
        })
    }

    /// Run a remote command with an explicit timeout.
    pub fn execute(&self, command: &str, timeout: Duration) -> Result<String> {
        if self.state != SessionState::Connected {
            return Err(TransferError::NotConnected);
        }
        tracing::debug!(command, timeout_secs = timeout.as_secs(), "executing remote command");
        self.shell.execute(command, timeout)
    }

    /// Run a short remote command (existence checks, mkdir, listings).
    pub fn probe(&self, command: &str) -> Result<String> {
        self.execute(command, self.probe_timeout)
    }
}
