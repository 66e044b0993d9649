//! Seams to the systems the transfer engine talks to.
//!
//! The engine never touches the network directly for instance metadata or
//! remote commands. It goes through two traits:
//!
//! - [`StatusSource`]: the provisioning API's instance listing, in whatever
//!   shape it happens to come back.
//! - [`SecureShell`]: an SSH session that can connect, report its state and
//!   run commands.
//!
//! Remote commands report their outcome by printing a sentinel token
//! ([`SUCCESS_TOKEN`], [`EXISTS_TOKEN`]) that callers look for as a whole output line.

pub mod ssh;
pub mod status;

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::Result;

pub use ssh::Ssh2Shell;
pub use status::{CommandStatusSource, FileStatusSource, HttpStatusSource};

/// Printed by remote commands that completed.
pub const SUCCESS_TOKEN: &str = "success";
/// Printed by remote existence checks that passed.
pub const EXISTS_TOKEN: &str = "exists";
/// Prefix of a failed command's output.
pub const ERROR_MARKER: &str = "Error";
/// Emitted by coreutils when a path is missing.
pub const MISSING_MARKER: &str = "No such file or directory";

/// Raw instance status as returned by the provisioning API.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusPayload {
    /// Unparsed text; expected to be JSON.
    Text(String),
    /// Already-structured data.
    Json(Value),
}

/// Provisioning API: lists instances and their connection metadata.
pub trait StatusSource: Send {
    fn fetch_status(&self) -> Result<StatusPayload>;
}

/// Parameters for a single SSH handshake attempt.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_path: PathBuf,
    pub key_passphrase: Option<String>,
    pub timeout: Duration,
}

/// Details of the live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub username: String,
    pub port: u16,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// SSH session manager.
pub trait SecureShell: Send {
    /// Authenticate against `request.host`. Replaces any previous session.
    fn connect(&mut self, request: &ConnectRequest) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// `None` when no session is live.
    fn connection_info(&self) -> Option<ConnectionInfo>;

    /// Run `command` through the remote shell and return its stdout with
    /// stderr interleaved. A non-zero exit status is not an error; callers inspect the
    /// output for sentinel tokens.
    fn execute(&self, command: &str, timeout: Duration) -> Result<String>;
}

/// Whether some line of `output` is exactly `token`.
///
/// Whole-line matching keeps an echoed path that merely contains the token
/// from passing as success.
pub fn has_token(output: &str, token: &str) -> bool {
    output.lines().any(|line| line.trim() == token)
}

/// Wrap `command` so its stderr is folded into stdout on the remote side.
pub fn merged_command(command: &str) -> String {
    format!("{{ {command}\n}} 2>&1")
}

/// Quote a path for interpolation into a remote shell command.
pub fn quote(path: &str) -> Cow<'_, str> {
    shell_words::quote(path)
}

/// `test -f <path> && echo 'exists'`
pub fn file_exists_command(path: &str) -> String {
    format!("test -f {} && echo '{EXISTS_TOKEN}'", quote(path))
}

/// `test -s <path> && echo 'exists'`; passes only for non-empty regular files.
pub fn non_empty_file_command(path: &str) -> String {
    format!("test -s {} && echo '{EXISTS_TOKEN}'", quote(path))
}

/// Parent directory of a remote POSIX path, if it has one worth creating.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let (parent, _) = trimmed.rsplit_once('/')?;
    if parent.is_empty() { None } else { Some(parent) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_parent() {
        assert_eq!(remote_parent("/data/in/video.mp4"), Some("/data/in"));
        assert_eq!(remote_parent("out/clip.mp4"), Some("out"));
        assert_eq!(remote_parent("/video.mp4"), None);
        assert_eq!(remote_parent("video.mp4"), None);
        assert_eq!(remote_parent("/data/in/"), Some("/data"));
    }

    #[test]
    fn test_existence_commands_quote_paths() {
        let words = shell_words::split(&file_exists_command("/tmp/a b.txt")).unwrap();
        assert_eq!(words, ["test", "-f", "/tmp/a b.txt", "&&", "echo", "exists"]);

        let words = shell_words::split(&non_empty_file_command("/tmp/it's.txt")).unwrap();
        assert_eq!(words, ["test", "-s", "/tmp/it's.txt", "&&", "echo", "exists"]);
    }

    #[test]
    fn test_has_token_matches_whole_lines() {
        assert!(has_token("success\n", SUCCESS_TOKEN));
        assert!(has_token("extracting\n  success  \n", SUCCESS_TOKEN));
        assert!(!has_token("sh: cd: /data/success: No such file or directory\n", SUCCESS_TOKEN));
        assert!(!has_token("", EXISTS_TOKEN));
        assert!(!has_token("nonexistent", EXISTS_TOKEN));
    }

    #[test]
    fn test_merged_command_folds_stderr_into_stdout() {
        let noisy = "echo first; head -c 300000 /dev/zero | tr '\\0' e >&2; echo last";
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(merged_command(noisy))
            .output()
            .unwrap();
        assert!(output.stderr.is_empty());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.starts_with("first\n"));
        assert!(stdout.ends_with("last\n"));
        assert_eq!(stdout.len(), "first\n".len() + 300_000 + "last\n".len());
    }

    #[test]
    fn test_connection_info_display() {
        let info = ConnectionInfo {
            host: "10.0.0.5".into(),
            username: "ubuntu".into(),
            port: 2222,
        };
        assert_eq!(info.to_string(), "ubuntu@10.0.0.5:2222");
    }
}
