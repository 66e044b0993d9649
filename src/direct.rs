//! Direct transfer over the SSH transport.
//!
//! Used as the upload fallback when relaying fails, and as the only download
//! mechanism. The copy itself goes through a [`FileCopier`]; the production
//! implementation shells out to `scp`.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::connection::{ConnectionManager, SshTarget};
use crate::remote::{EXISTS_TOKEN, file_exists_command, has_token};
use crate::retry::RetryPolicy;
use crate::{Result, TransferError};

/// Copies single files between the local machine and an [`SshTarget`].
pub trait FileCopier: Send {
    fn upload(&self, target: &SshTarget, local: &Path, remote: &str) -> Result<()>;
    fn download(&self, target: &SshTarget, remote: &str, local: &Path) -> Result<()>;
}

/// `scp` with host-key checking disabled.
///
/// Instance identity comes from the provisioning API, and instances are
/// recycled often enough that known_hosts entries would only go stale.
#[derive(Debug, Clone)]
pub struct ScpCopier {
    connect_timeout: Duration,
    keepalive: Duration,
}

impl Default for ScpCopier {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
        }
    }
}

impl ScpCopier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options shared by every scp invocation, without the endpoints.
    pub fn base_args(&self, target: &SshTarget) -> Vec<String> {
        vec![
            "-P".into(),
            target.port.to_string(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-o".into(),
            format!("ServerAliveInterval={}", self.keepalive.as_secs()),
            "-i".into(),
            target.key_path.display().to_string(),
        ]
    }

    fn run(&self, target: &SshTarget, from: &str, to: &str) -> Result<()> {
        let output = Command::new("scp")
            .args(self.base_args(target))
            .arg(from)
            .arg(to)
            .output()
            .map_err(|e| TransferError::Copy(format!("failed to execute scp: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let unreachable =
            stderr.contains("Connection refused") || stderr.contains("Connection timed out");
        let detail = if unreachable {
            format!("SSH connection failed: {}", stderr.trim())
        } else if stderr.contains("Permission denied") {
            format!("Permission denied: {}", stderr.trim())
        } else {
            format!("scp failed: {}", stderr.trim())
        };
        Err(TransferError::Copy(detail))
    }
}

impl FileCopier for ScpCopier {
    fn upload(&self, target: &SshTarget, local: &Path, remote: &str) -> Result<()> {
        self.run(
            target,
            &local.display().to_string(),
            &target.remote_spec(remote),
        )
    }

    fn download(&self, target: &SshTarget, remote: &str, local: &Path) -> Result<()> {
        self.run(
            target,
            &target.remote_spec(remote),
            &local.display().to_string(),
        )
    }
}

/// Copy `local` to `remote`, verifying with `test -f` after each copy.
pub fn direct_upload(
    copier: &dyn FileCopier,
    connection: &ConnectionManager,
    target: &SshTarget,
    local: &Path,
    remote: &str,
    policy: RetryPolicy,
) -> Result<()> {
    let what = local.display().to_string();
    policy.run(
        &what,
        |attempt| {
            tracing::info!(local = %local.display(), remote, attempt, max = policy.max_attempts, "uploading over scp");
            copier.upload(target, local, remote)
        },
        |_| match connection.probe(&file_exists_command(remote)) {
            Ok(out) if has_token(&out, EXISTS_TOKEN) => {
                tracing::info!(remote, "verified file on instance");
                true
            }
            Ok(_) => {
                tracing::warn!(remote, "copy reported success but file is missing on instance");
                false
            }
            Err(e) => {
                tracing::warn!(remote, error = %e, "could not verify upload");
                false
            }
        },
    )
}

/// Copy `remote` to `local`, verifying the local file after each copy.
pub fn direct_download(
    copier: &dyn FileCopier,
    target: &SshTarget,
    remote: &str,
    local: &Path,
    policy: RetryPolicy,
) -> Result<()> {
    policy.run(
        remote,
        |attempt| {
            tracing::info!(remote, local = %local.display(), attempt, max = policy.max_attempts, "downloading over scp");
            copier.download(target, remote, local)
        },
        |_| {
            let present = local.exists();
            if !present {
                tracing::warn!(local = %local.display(), "copy reported success but local file is missing");
            }
            present
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn target() -> SshTarget {
        SshTarget {
            host: "10.0.0.9".into(),
            port: 2222,
            username: "ubuntu".into(),
            key_path: PathBuf::from("/keys/id"),
        }
    }

    #[test]
    fn test_scp_base_args() {
        let args = ScpCopier::new().base_args(&target());
        assert_eq!(
            args,
            vec![
                "-P",
                "2222",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "ConnectTimeout=30",
                "-o",
                "ServerAliveInterval=30",
                "-i",
                "/keys/id",
            ]
        );
    }

    /// Fails the first `failures` downloads, then writes the file.
    struct FlakyDownloader {
        failures: Mutex<u32>,
    }

    impl FileCopier for FlakyDownloader {
        fn upload(&self, _: &SshTarget, _: &Path, _: &str) -> Result<()> {
            unreachable!("upload not used")
        }

        fn download(&self, _: &SshTarget, _: &str, local: &Path) -> Result<()> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransferError::Copy("Connection timed out".into()));
            }
            std::fs::write(local, b"frame data")?;
            Ok(())
        }
    }

    #[test]
    fn test_direct_download_recovers_after_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("out.bin");
        let copier = FlakyDownloader {
            failures: Mutex::new(2),
        };
        direct_download(
            &copier,
            &target(),
            "/remote/out.bin",
            &local,
            RetryPolicy::new(3, Duration::ZERO),
        )
        .unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), b"frame data");
    }

    #[test]
    fn test_direct_download_exhausts() {
        let tmp = tempfile::tempdir().unwrap();
        let copier = FlakyDownloader {
            failures: Mutex::new(5),
        };
        let err = direct_download(
            &copier,
            &target(),
            "/remote/out.bin",
            &tmp.path().join("out.bin"),
            RetryPolicy::new(2, Duration::ZERO),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TransferError::RetriesExhausted { what, attempts: 2 } if what == "/remote/out.bin"
        ));
    }
}
