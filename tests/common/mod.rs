#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relaycopy::relay::{LargeFileHost, LargeUpload, ManualUrlSource, NoManualUrl, SmallFileHost};
use relaycopy::remote::{ConnectRequest, ConnectionInfo, SecureShell, StatusPayload, StatusSource};
use relaycopy::connection::SshTarget;
use relaycopy::direct::FileCopier;
use relaycopy::{Collaborators, FileTransfer, TransferConfig, TransferError};
use serde_json::{Value, json};
use tempfile::TempDir;

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub const INSTANCE: &str = "gpu-1";

pub fn status_doc() -> Value {
    json!({
        "instances": [
            {"id": "gpu-0", "ip": "10.0.0.1"},
            {"id": INSTANCE, "sshCommand": "ssh -p 31000 ubuntu@10.9.8.7"}
        ]
    })
}

pub struct StaticStatus(pub Value);

impl StatusSource for StaticStatus {
    fn fetch_status(&self) -> relaycopy::Result<StatusPayload> {
        Ok(StatusPayload::Json(self.0.clone()))
    }
}

/// Answers remote commands with canned output and records every command.
pub struct ScriptedShell {
    pub commands: Log,
    pub connects: Log,
    respond: Box<dyn Fn(&str) -> String + Send>,
    info: Option<ConnectionInfo>,
}

impl ScriptedShell {
    pub fn new(respond: impl Fn(&str) -> String + Send + 'static) -> Self {
        Self {
            commands: log(),
            connects: log(),
            respond: Box::new(respond),
            info: None,
        }
    }

    /// Every fetch, extraction and existence check succeeds.
    pub fn happy() -> Self {
        Self::new(happy_response)
    }
}

pub fn happy_response(command: &str) -> String {
    if command.starts_with("test ") {
        "exists\n".into()
    } else if command.ends_with("echo 'success'") {
        "success\n".into()
    } else {
        String::new()
    }
}

impl SecureShell for ScriptedShell {
    fn connect(&mut self, request: &ConnectRequest) -> relaycopy::Result<()> {
        self.connects.lock().unwrap().push(request.username.clone());
        self.info = Some(ConnectionInfo {
            host: request.host.clone(),
            username: request.username.clone(),
            port: request.port,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.info.is_some()
    }

    fn connection_info(&self) -> Option<ConnectionInfo> {
        self.info.clone()
    }

    fn execute(&self, command: &str, _timeout: Duration) -> relaycopy::Result<String> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok((self.respond)(command))
    }
}

/// Runs "remote" commands on this machine with `sh -c`.
pub struct LoopbackShell {
    pub commands: Log,
    connected: bool,
}

impl LoopbackShell {
    pub fn new() -> Self {
        Self {
            commands: log(),
            connected: false,
        }
    }
}

impl SecureShell for LoopbackShell {
    fn connect(&mut self, _request: &ConnectRequest) -> relaycopy::Result<()> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connection_info(&self) -> Option<ConnectionInfo> {
        self.connected.then(|| ConnectionInfo {
            host: "127.0.0.1".into(),
            username: "ubuntu".into(),
            port: 22,
        })
    }

    fn execute(&self, command: &str, _timeout: Duration) -> relaycopy::Result<String> {
        self.commands.lock().unwrap().push(command.to_string());
        let output = Command::new("sh").arg("-c").arg(command).output()?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CopyCall {
    Upload { local: PathBuf, remote: String },
    Download { remote: String, local: PathBuf },
}

/// Records copies and fails the first `failures` uploads.
///
/// In loopback mode remote paths are local paths and files really move;
/// otherwise uploads only record and downloads write a fixed payload.
pub struct TestCopier {
    pub calls: Arc<Mutex<Vec<CopyCall>>>,
    upload_failures: Mutex<u32>,
    loopback: bool,
}

pub const DOWNLOAD_PAYLOAD: &[u8] = b"rendered frames";

impl TestCopier {
    pub fn recording() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            upload_failures: Mutex::new(0),
            loopback: false,
        }
    }

    pub fn loopback() -> Self {
        Self {
            loopback: true,
            ..Self::recording()
        }
    }

    pub fn failing_uploads(self, failures: u32) -> Self {
        *self.upload_failures.lock().unwrap() = failures;
        self
    }
}

impl FileCopier for TestCopier {
    fn upload(&self, _target: &SshTarget, local: &Path, remote: &str) -> relaycopy::Result<()> {
        self.calls.lock().unwrap().push(CopyCall::Upload {
            local: local.to_path_buf(),
            remote: remote.to_string(),
        });
        let mut failures = self.upload_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(TransferError::Copy("SSH connection failed: Connection timed out".into()));
        }
        if self.loopback {
            fs::copy(local, remote)?;
        }
        Ok(())
    }

    fn download(&self, _target: &SshTarget, remote: &str, local: &Path) -> relaycopy::Result<()> {
        self.calls.lock().unwrap().push(CopyCall::Download {
            remote: remote.to_string(),
            local: local.to_path_buf(),
        });
        if self.loopback {
            fs::copy(remote, local)?;
        } else {
            fs::write(local, DOWNLOAD_PAYLOAD)?;
        }
        Ok(())
    }
}

/// Returns `https://small.relay.test/<name>` or fails every upload.
pub struct FakeSmallHost {
    pub uploads: Log,
    fail: bool,
}

impl FakeSmallHost {
    pub fn working() -> Self {
        Self {
            uploads: log(),
            fail: false,
        }
    }

    pub fn broken() -> Self {
        Self {
            uploads: log(),
            fail: true,
        }
    }
}

impl SmallFileHost for FakeSmallHost {
    fn upload(&self, _local: &Path, name: &str) -> relaycopy::Result<String> {
        self.uploads.lock().unwrap().push(name.to_string());
        if self.fail {
            return Err(TransferError::Relay("small-file host returned 503".into()));
        }
        Ok(format!("https://small.relay.test/{name}"))
    }
}

/// Records `server` and `upload:<server>` calls in order.
pub struct FakeLargeHost {
    pub calls: Log,
}

impl FakeLargeHost {
    pub fn new() -> Self {
        Self { calls: log() }
    }
}

pub const LARGE_LINK: &str = "https://store7.large.relay.test/download/abc123/big.bin";

impl LargeFileHost for FakeLargeHost {
    fn server(&self) -> relaycopy::Result<String> {
        self.calls.lock().unwrap().push("server".into());
        Ok("store7".into())
    }

    fn upload(&self, server: &str, _local: &Path) -> relaycopy::Result<LargeUpload> {
        self.calls.lock().unwrap().push(format!("upload:{server}"));
        Ok(LargeUpload {
            page_url: "https://large.relay.test/d/abc123".into(),
            file_id: "abc123".into(),
            direct_link: LARGE_LINK.into(),
        })
    }
}

/// Config with a real key file under `tmp` and no backoff delay.
pub fn test_config(tmp: &TempDir) -> TransferConfig {
    let key = tmp.path().join("id_ed25519");
    fs::write(&key, "not a real key").unwrap();
    TransferConfig {
        key_path: Some(key),
        backoff_step: Duration::ZERO,
        ..TransferConfig::default()
    }
}

pub fn transfer(
    tmp: &TempDir,
    shell: impl SecureShell + 'static,
    copier: TestCopier,
    small: FakeSmallHost,
    large: FakeLargeHost,
) -> FileTransfer {
    transfer_with_manual(tmp, shell, copier, small, large, Box::new(NoManualUrl))
}

pub fn transfer_with_manual(
    tmp: &TempDir,
    shell: impl SecureShell + 'static,
    copier: TestCopier,
    small: FakeSmallHost,
    large: FakeLargeHost,
    manual: Box<dyn ManualUrlSource>,
) -> FileTransfer {
    let parts = Collaborators {
        status: Box::new(StaticStatus(status_doc())),
        shell: Box::new(shell),
        copier: Box::new(copier),
        small_host: Box::new(small),
        large_host: Box::new(large),
        manual_url: manual,
    };
    FileTransfer::new(INSTANCE, test_config(tmp), parts)
}

/// A sparse file of `mb` MiB.
pub fn sparse_file(dir: &Path, name: &str, mb: u64) -> PathBuf {
    let path = dir.join(name);
    let file = fs::File::create(&path).unwrap();
    file.set_len(mb * 1024 * 1024).unwrap();
    path
}
