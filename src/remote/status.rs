//! Concrete [`StatusSource`] implementations.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use super::{StatusPayload, StatusSource};
use crate::{Result, TransferError};

/// Reads the status document from a local JSON file.
#[derive(Debug, Clone)]
pub struct FileStatusSource {
    path: PathBuf,
}

impl FileStatusSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatusSource for FileStatusSource {
    fn fetch_status(&self) -> Result<StatusPayload> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            TransferError::Status(format!("failed to read {}: {e}", self.path.display()))
        })?;
        Ok(StatusPayload::Text(text))
    }
}

/// Fetches the status document from the provisioning API over HTTP.
pub struct HttpStatusSource {
    url: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpStatusSource {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransferError::Status(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            token,
            client,
        })
    }
}

impl StatusSource for HttpStatusSource {
    fn fetch_status(&self) -> Result<StatusPayload> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| TransferError::Status(format!("status request failed: {e}")))?;
        let body = response
            .text()
            .map_err(|e| TransferError::Status(format!("status body unreadable: {e}")))?;
        tracing::debug!(url = %self.url, bytes = body.len(), "fetched instance status");
        Ok(StatusPayload::Text(body))
    }
}

/// Runs a local shell command and takes its stdout as the status document.
///
/// Useful when the provisioning API is wrapped by its own CLI.
#[derive(Debug, Clone)]
pub struct CommandStatusSource {
    command: String,
}

impl CommandStatusSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl StatusSource for CommandStatusSource {
    fn fetch_status(&self) -> Result<StatusPayload> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .output()
            .map_err(|e| TransferError::Status(format!("failed to execute sh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransferError::Status(format!(
                "status command failed: {}",
                stderr.trim()
            )));
        }

        Ok(StatusPayload::Text(
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_status_source_reads_text() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("status.json");
        std::fs::write(&path, r#"{"instances": []}"#).unwrap();

        let payload = FileStatusSource::new(&path).fetch_status().unwrap();
        assert_eq!(payload, StatusPayload::Text(r#"{"instances": []}"#.into()));
    }

    #[test]
    fn test_file_status_source_missing_file() {
        let err = FileStatusSource::new("/nonexistent/status.json")
            .fetch_status()
            .unwrap_err();
        assert!(matches!(err, TransferError::Status(_)));
    }

    #[test]
    fn test_command_status_source() {
        let payload = CommandStatusSource::new(r#"echo '{"data": []}'"#)
            .fetch_status()
            .unwrap();
        match payload {
            StatusPayload::Text(text) => assert_eq!(text.trim(), r#"{"data": []}"#),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_command_status_source_failure() {
        let err = CommandStatusSource::new("echo boom >&2; exit 3")
            .fetch_status()
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
