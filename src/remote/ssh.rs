//! [`SecureShell`] backed by libssh2.

use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use ssh2::Session;

use super::{ConnectRequest, ConnectionInfo, SecureShell, merged_command};
use crate::{Result, TransferError};

/// Keepalive interval sent on idle sessions, in seconds.
const KEEPALIVE_SECS: u32 = 30;

struct LiveSession {
    session: Session,
    info: ConnectionInfo,
}

/// Public-key authenticated SSH session.
#[derive(Default)]
pub struct Ssh2Shell {
    live: Option<LiveSession>,
}

impl Ssh2Shell {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
        (host, port)
            .to_socket_addrs()
            .map_err(|e| TransferError::Ssh(format!("cannot resolve {host}:{port}: {e}")))?
            .next()
            .ok_or_else(|| TransferError::Ssh(format!("no address for {host}:{port}")))
    }
}

impl SecureShell for Ssh2Shell {
    fn connect(&mut self, request: &ConnectRequest) -> Result<()> {
        self.live = None;

        let addr = Self::resolve_addr(&request.host, request.port)?;
        let tcp = TcpStream::connect_timeout(&addr, request.timeout)
            .map_err(|e| TransferError::Ssh(format!("TCP connect to {addr} failed: {e}")))?;

        let mut session =
            Session::new().map_err(|e| TransferError::Ssh(format!("session init: {e}")))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(duration_ms(request.timeout));
        session
            .handshake()
            .map_err(|e| TransferError::Ssh(format!("handshake with {addr} failed: {e}")))?;
        session
            .userauth_pubkey_file(
                &request.username,
                None,
                &request.key_path,
                request.key_passphrase.as_deref(),
            )
            .map_err(|e| {
                TransferError::Ssh(format!("authentication as {} failed: {e}", request.username))
            })?;

        if !session.authenticated() {
            return Err(TransferError::Ssh(format!(
                "server did not accept key for {}",
                request.username
            )));
        }
        session.set_keepalive(true, KEEPALIVE_SECS);

        let info = ConnectionInfo {
            host: request.host.clone(),
            username: request.username.clone(),
            port: request.port,
        };
        tracing::debug!(session = %info, "ssh session authenticated");
        self.live = Some(LiveSession { session, info });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.live.as_ref().is_some_and(|l| l.session.authenticated())
    }

    fn connection_info(&self) -> Option<ConnectionInfo> {
        self.live
            .as_ref()
            .filter(|l| l.session.authenticated())
            .map(|l| l.info.clone())
    }

    fn execute(&self, command: &str, timeout: Duration) -> Result<String> {
        let live = self.live.as_ref().ok_or(TransferError::NotConnected)?;
        live.session.set_timeout(duration_ms(timeout));

        let ssh_err = |e: ssh2::Error| TransferError::Ssh(format!("`{command}`: {e}"));
        let mut channel = live.session.channel_session().map_err(ssh_err)?;
        // One stream only: reading stdout to EOF cannot stall on a full stderr window.
        channel.exec(&merged_command(command)).map_err(ssh_err)?;

        let mut output = String::new();
        channel.read_to_string(&mut output)?;
        channel.wait_close().map_err(ssh_err)?;
        let exit = channel.exit_status().map_err(ssh_err)?;

        tracing::debug!(command, exit, "remote command finished");
        Ok(output)
    }
}

fn duration_ms(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}
