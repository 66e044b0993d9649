//! Transfer configuration read from the process environment.
//!
//! Only the SSH key path is mandatory, and it is checked lazily when the
//! first connection is made, so building a config never fails.
//!
//! | Variable                    | Default                 |
//! |-----------------------------|-------------------------|
//! | `SSH_PRIVATE_KEY_PATH`      | (required to connect)   |
//! | `SSH_KEY_PASSWORD`          | none                    |
//! | `RELAYCOPY_SSH_USERS`       | `ubuntu,root`           |
//! | `RELAYCOPY_BACKOFF_SECS`    | `5`                     |
//! | `RELAYCOPY_SMALL_RELAY_URL` | `https://transfer.sh`   |
//! | `RELAYCOPY_LARGE_RELAY_API` | `https://api.gofile.io` |

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const KEY_PATH_VAR: &str = "SSH_PRIVATE_KEY_PATH";
pub const KEY_PASSWORD_VAR: &str = "SSH_KEY_PASSWORD";
pub const USERS_VAR: &str = "RELAYCOPY_SSH_USERS";
pub const BACKOFF_VAR: &str = "RELAYCOPY_BACKOFF_SECS";
pub const SMALL_RELAY_VAR: &str = "RELAYCOPY_SMALL_RELAY_URL";
pub const LARGE_RELAY_VAR: &str = "RELAYCOPY_LARGE_RELAY_API";

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_PRIMARY_USER: &str = "ubuntu";
pub const DEFAULT_FALLBACK_USER: &str = "root";
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(5);
pub const DEFAULT_SMALL_RELAY_URL: &str = "https://transfer.sh";
pub const DEFAULT_LARGE_RELAY_API: &str = "https://api.gofile.io";

/// Timeouts for remote commands, by kind of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Existence checks, mkdir, listings.
    pub probe: Duration,
    /// Remote fetch of a small relay upload, and archive extraction.
    pub small_fetch: Duration,
    /// Remote fetch of a large relay upload.
    pub large_fetch: Duration,
    /// Remote fetch of a manually supplied URL.
    pub manual_fetch: Duration,
    /// TCP connect and SSH handshake.
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(30),
            small_fetch: Duration::from_secs(300),
            large_fetch: Duration::from_secs(600),
            manual_fetch: Duration::from_secs(1800),
            connect: Duration::from_secs(30),
        }
    }
}

/// Everything the transfer engine reads from its environment.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Private key used for both the SSH session and scp. Tilde-expanded.
    pub key_path: Option<PathBuf>,
    /// Optional passphrase for `key_path`.
    pub key_passphrase: Option<String>,
    /// Login names tried in order until one authenticates.
    pub usernames: Vec<String>,
    /// Linear backoff step: the delay before attempt `k` is `step * (k - 1)`.
    pub backoff_step: Duration,
    pub small_relay_url: String,
    pub large_relay_api: String,
    pub timeouts: Timeouts,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            key_path: None,
            key_passphrase: None,
            usernames: vec![
                DEFAULT_PRIMARY_USER.to_string(),
                DEFAULT_FALLBACK_USER.to_string(),
            ],
            backoff_step: DEFAULT_BACKOFF_STEP,
            small_relay_url: DEFAULT_SMALL_RELAY_URL.to_string(),
            large_relay_api: DEFAULT_LARGE_RELAY_API.to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

impl TransferConfig {
    /// Build a config from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        config.key_path = non_empty(KEY_PATH_VAR).map(|p| expand_tilde(p.trim()));
        config.key_passphrase = non_empty(KEY_PASSWORD_VAR);

        if let Some(users) = non_empty(USERS_VAR) {
            let parsed: Vec<String> = users
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
            if parsed.is_empty() {
                tracing::warn!(var = USERS_VAR, value = %users, "no usernames parsed, keeping defaults");
            } else {
                config.usernames = parsed;
            }
        }

        if let Some(raw) = non_empty(BACKOFF_VAR) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => config.backoff_step = Duration::from_secs(secs),
                Err(e) => {
                    tracing::warn!(var = BACKOFF_VAR, value = %raw, error = %e, "invalid backoff, keeping default")
                }
            }
        }

        if let Some(url) = non_empty(SMALL_RELAY_VAR) {
            config.small_relay_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(url) = non_empty(LARGE_RELAY_VAR) {
            config.large_relay_api = url.trim().trim_end_matches('/').to_string();
        }

        config
    }

    /// Username tried first, and the one assumed when no session exists.
    pub fn primary_username(&self) -> &str {
        self.usernames
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_PRIMARY_USER)
    }
}

/// Expand a leading `~` or `~/` to the local home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    let home = || dirs::home_dir().unwrap_or_default();
    if path == "~" {
        home()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home().join(rest)
    } else {
        Path::new(path).to_path_buf()
    }
}
