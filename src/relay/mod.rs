//! Relay uploader: pushes a file to a public temporary host, then has the
//! instance pull it down with `curl`.
//!
//! This sidesteps networks where inbound scp to the instance is slow or
//! blocked but outbound HTTPS from it is fine. The host is picked by size:
//!
//! | Size            | Route                                         |
//! |-----------------|-----------------------------------------------|
//! | < 25 MB         | [`SmallFileHost`], one PUT                    |
//! | 25 MB - 2000 MB | [`LargeFileHost`], server lookup then upload  |
//! | >= 2000 MB      | [`ManualUrlSource`], or fail                  |
//!
//! Relay artifacts are never reused: each attempt uploads under a fresh name.

pub mod hosts;
pub mod manual;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use uuid::Uuid;

use crate::config::Timeouts;
use crate::connection::ConnectionManager;
use crate::remote::{EXISTS_TOKEN, SUCCESS_TOKEN, has_token, non_empty_file_command, quote};
use crate::retry::RetryPolicy;
use crate::{Result, TransferError};

pub use hosts::{GofileHost, LargeFileHost, LargeUpload, SmallFileHost, TransferShHost};
pub use manual::{FixedManualUrl, ManualUrlSource, NoManualUrl, PromptManualUrl};

/// Files below this go to the small-file host.
pub const SMALL_TIER_LIMIT_MB: f64 = 25.0;
/// Files below this (and at least [`SMALL_TIER_LIMIT_MB`]) go to the large-file host.
pub const LARGE_TIER_LIMIT_MB: f64 = 2000.0;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayTier {
    Small,
    Large,
    Manual,
}

impl RelayTier {
    pub fn for_size(size_mb: f64) -> Self {
        if size_mb < SMALL_TIER_LIMIT_MB {
            Self::Small
        } else if size_mb < LARGE_TIER_LIMIT_MB {
            Self::Large
        } else {
            Self::Manual
        }
    }
}

impl fmt::Display for RelayTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small => write!(f, "small"),
            Self::Large => write!(f, "large"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Name a relay upload so concurrent or repeated uploads never collide.
pub fn unique_relay_name(local: &Path) -> String {
    let base = local
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    format!("{}_{}", Uuid::new_v4().simple(), base)
}

/// `curl -s -L <url> -o <remote> && echo 'success'`
pub fn remote_fetch_command(url: &str, remote: &str) -> String {
    format!(
        "curl -s -L {} -o {} && echo '{SUCCESS_TOKEN}'",
        quote(url),
        quote(remote)
    )
}

pub struct RelayUploader {
    small: Box<dyn SmallFileHost>,
    large: Box<dyn LargeFileHost>,
    manual: Box<dyn ManualUrlSource>,
    timeouts: Timeouts,
    backoff_step: Duration,
}

impl RelayUploader {
    pub fn new(
        small: Box<dyn SmallFileHost>,
        large: Box<dyn LargeFileHost>,
        manual: Box<dyn ManualUrlSource>,
        timeouts: Timeouts,
        backoff_step: Duration,
    ) -> Self {
        Self {
            small,
            large,
            manual,
            timeouts,
            backoff_step,
        }
    }

    /// Relay `local` to `remote` on the connected instance.
    pub fn upload(
        &self,
        connection: &ConnectionManager,
        local: &Path,
        remote: &str,
        max_retries: u32,
    ) -> Result<()> {
        let size_bytes = std::fs::metadata(local)
            .map_err(|_| TransferError::LocalNotFound(local.to_path_buf()))?
            .len();
        let size_mb = size_bytes as f64 / BYTES_PER_MB;
        let tier = RelayTier::for_size(size_mb);
        tracing::info!(local = %local.display(), size_mb = %format!("{size_mb:.2}"), %tier, "relay upload");

        let policy = RetryPolicy::new(max_retries, self.backoff_step);
        let what = local.display().to_string();
        let verify = |_: &()| verify_non_empty(connection, remote);

        match tier {
            RelayTier::Small => policy.run(
                &what,
                |attempt| {
                    let name = unique_relay_name(local);
                    tracing::debug!(attempt, name = %name, "uploading to small-file host");
                    let url = self.small.upload(local, &name)?;
                    tracing::info!(url = %url, "uploaded to small-file host");
                    fetch_on_instance(connection, &url, remote, self.timeouts.small_fetch)
                },
                verify,
            ),
            RelayTier::Large => policy.run(
                &what,
                |attempt| {
                    let server = self.large.server()?;
                    tracing::debug!(attempt, server = %server, "large-file host assigned server");
                    let upload = self.large.upload(&server, local)?;
                    tracing::info!(
                        page = %upload.page_url,
                        file_id = %upload.file_id,
                        link = %upload.direct_link,
                        "uploaded to large-file host"
                    );
                    fetch_on_instance(
                        connection,
                        &upload.direct_link,
                        remote,
                        self.timeouts.large_fetch,
                    )
                },
                verify,
            ),
            RelayTier::Manual => self.manual_upload(connection, local, remote, size_mb),
        }
    }

    fn manual_upload(
        &self,
        connection: &ConnectionManager,
        local: &Path,
        remote: &str,
        size_mb: f64,
    ) -> Result<()> {
        tracing::warn!(
            local = %local.display(),
            size_mb = %format!("{size_mb:.2}"),
            "file exceeds relay limits; split it, stage it in cloud storage, or use a dedicated transfer service"
        );

        let Some(url) = self.manual.manual_url(local, size_mb) else {
            return Err(TransferError::TooLargeForRelay {
                path: local.to_path_buf(),
                size_mb: size_mb.round() as u64,
            });
        };

        tracing::info!(url = %url, "instance fetching from supplied URL");
        fetch_on_instance(connection, &url, remote, self.timeouts.manual_fetch)?;
        if !verify_non_empty(connection, remote) {
            return Err(TransferError::RemoteFetch(format!(
                "{remote} is missing or empty after fetching {url}"
            )));
        }
        tracing::info!(url = %url, remote, "transferred via supplied URL");
        Ok(())
    }
}

/// Have the instance download `url` to `remote`.
fn fetch_on_instance(
    connection: &ConnectionManager,
    url: &str,
    remote: &str,
    timeout: Duration,
) -> Result<()> {
    let output = connection.execute(&remote_fetch_command(url, remote), timeout)?;
    if has_token(&output, SUCCESS_TOKEN) {
        Ok(())
    } else {
        Err(TransferError::RemoteFetch(output.trim().to_string()))
    }
}

fn verify_non_empty(connection: &ConnectionManager, remote: &str) -> bool {
    match connection.probe(&non_empty_file_command(remote)) {
        Ok(out) if has_token(&out, EXISTS_TOKEN) => true,
        Ok(_) => {
            tracing::warn!(remote, "fetch reported success but file is missing or empty");
            false
        }
        Err(e) => {
            tracing::warn!(remote, error = %e, "could not verify relayed file");
            false
        }
    }
}
