use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};
use ssh2::{
    CheckResult, HostKeyType, KnownHostFileKind, KnownHostKeyFormat, OpenFlags, OpenType, Session,
};
use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{AuthMethod, CommandOutput, RemoteSession, SshTarget, Transport, TransportError};
use crate::config::HostKeyPolicy;

/// [`Transport`] backed by libssh2.
pub struct Ssh2Transport {
    known_hosts_path: PathBuf,
    policy: HostKeyPolicy,
}

impl Ssh2Transport {
    pub fn new(known_hosts_path: PathBuf, policy: HostKeyPolicy) -> Self {
        Self {
            known_hosts_path,
            policy,
        }
    }

    fn verify_host_key(&self, session: &Session, target: &SshTarget) -> Result<(), TransportError> {
        if self.policy == HostKeyPolicy::Off {
            return Ok(());
        }
        let host_key_error = |message: String| TransportError::HostKey {
            host: target.host.clone(),
            message,
        };
        let (host_key, host_key_type) = session
            .host_key()
            .ok_or_else(|| host_key_error("SSH host key unavailable".to_string()))?;
        let fingerprint = fingerprint_sha256(host_key);

        let mut known_hosts = session
            .known_hosts()
            .map_err(|err| host_key_error(err.to_string()))?;
        let known_hosts_path = &self.known_hosts_path;
        if known_hosts_path.exists() {
            known_hosts
                .read_file(known_hosts_path, KnownHostFileKind::OpenSSH)
                .map_err(|err| host_key_error(err.to_string()))?;
        }
        match known_hosts.check_port(&target.host, target.port, host_key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound if self.policy == HostKeyPolicy::Strict => Err(host_key_error(
                format!("host key {fingerprint} is not in {}", known_hosts_path.display()),
            )),
            CheckResult::NotFound => {
                ensure_parent_dir(known_hosts_path).map_err(host_key_error)?;
                known_hosts
                    .add(
                        &known_hosts_host(&target.host, target.port),
                        host_key,
                        "swarmctl trusted",
                        KnownHostKeyFormat::from(host_key_type),
                    )
                    .map_err(|err| host_key_error(err.to_string()))?;
                known_hosts
                    .write_file(known_hosts_path, KnownHostFileKind::OpenSSH)
                    .map_err(|err| host_key_error(err.to_string()))?;
                tracing::info!(
                    host = %target.host,
                    port = target.port,
                    fingerprint = %fingerprint,
                    "trusted new SSH host key"
                );
                Ok(())
            }
            CheckResult::Mismatch => Err(host_key_error(format!(
                "host key changed (now {fingerprint}). If the Pi was reflashed, \
                 remove its entry from {} and retry.",
                known_hosts_path.display()
            ))),
            CheckResult::Failure => Err(host_key_error(format!(
                "unable to check against {}",
                known_hosts_path.display()
            ))),
        }
    }
}

impl Transport for Ssh2Transport {
    fn connect(
        &self,
        target: &SshTarget,
        auth: &AuthMethod<'_>,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, TransportError> {
        let session = handshake_ssh(&target.host, target.port, timeout)?;
        self.verify_host_key(&session, target)?;

        let auth_error = |message: String| TransportError::Auth {
            user: target.username.clone(),
            method: auth.kind(),
            message,
        };
        let result = match auth {
            AuthMethod::Key {
                private_key,
                public_key,
            } => session.userauth_pubkey_file(&target.username, *public_key, private_key, None),
            AuthMethod::Password(password) => {
                session.userauth_password(&target.username, password)
            }
        };
        result.map_err(|err| auth_error(err.to_string()))?;
        if !session.authenticated() {
            return Err(auth_error("server did not accept credentials".to_string()));
        }
        Ok(Box::new(Ssh2Session { session }))
    }
}

struct Ssh2Session {
    session: Session,
}

impl RemoteSession for Ssh2Session {
    fn exec(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        self.session
            .set_timeout(timeout.as_millis().min(u128::from(u32::MAX)) as u32);
        let mut channel = self
            .session
            .channel_session()
            .map_err(|err| TransportError::Channel(format!("failed to open channel: {err}")))?;
        channel
            .exec(command)
            .map_err(|err| TransportError::Channel(format!("failed to exec: {err}")))?;
        if let Some(stdin) = stdin {
            channel
                .write_all(stdin)
                .map_err(|err| stream_error("write stdin", err, timeout))?;
        }
        channel
            .send_eof()
            .map_err(|err| TransportError::Channel(format!("failed to send EOF: {err}")))?;
        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|err| stream_error("read stdout", err, timeout))?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|err| stream_error("read stderr", err, timeout))?;
        channel
            .wait_close()
            .map_err(|err| stream_error("close channel", err.into(), timeout))?;
        // libssh2 reports 0 when the server sent no exit-status, so a
        // signal-terminated command has to be caught here.
        let signal = channel
            .exit_signal()
            .map_err(|err| TransportError::Channel(format!("failed to read exit signal: {err}")))?
            .exit_signal;
        let status = channel
            .exit_status()
            .map_err(|err| TransportError::Channel(format!("failed to read exit status: {err}")))?;
        Ok(CommandOutput {
            exit_code: exit_code(status, signal.as_deref())?,
            stdout,
            stderr,
        })
    }

    fn upload(
        &mut self,
        remote_path: &str,
        contents: &[u8],
        mode: i32,
    ) -> Result<(), TransportError> {
        let upload_error = |message: String| TransportError::Upload {
            path: remote_path.to_string(),
            message,
        };
        let sftp = self
            .session
            .sftp()
            .map_err(|err| upload_error(format!("SFTP unavailable: {err}")))?;
        let mut remote = sftp
            .open_mode(
                Path::new(remote_path),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                mode,
                OpenType::File,
            )
            .map_err(|err| upload_error(err.to_string()))?;
        remote
            .write_all(contents)
            .map_err(|err| upload_error(err.to_string()))?;
        Ok(())
    }
}

fn stream_error(stage: &str, err: io::Error, timeout: Duration) -> TransportError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Channel(format!(
            "timed out after {}s ({stage})",
            timeout.as_secs()
        )),
        _ => TransportError::Channel(format!("failed to {stage}: {err}")),
    }
}

fn exit_code(status: i32, signal: Option<&str>) -> Result<i32, TransportError> {
    match signal {
        Some(signal) if !signal.is_empty() => Err(TransportError::Channel(format!(
            "remote command terminated by SIG{signal}"
        ))),
        _ => Ok(status),
    }
}

fn resolve_socket_addrs(host: &str, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
    let connect_error = |message: String| TransportError::Connect {
        host: host.to_string(),
        port,
        message,
    };
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|err| connect_error(format!("failed to resolve: {err}")))?
        .collect();
    if addrs.is_empty() {
        return Err(connect_error("no addresses resolved".to_string()));
    }
    Ok(addrs)
}

pub fn handshake_ssh(host: &str, port: u16, timeout: Duration) -> Result<Session, TransportError> {
    let connect_error = |message: String| TransportError::Connect {
        host: host.to_string(),
        port,
        message,
    };
    let mut last_error = None;
    let mut stream = None;
    for addr in resolve_socket_addrs(host, port)? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => {
                stream = Some(tcp);
                break;
            }
            Err(err) => last_error = Some(err),
        }
    }
    let tcp = stream.ok_or_else(|| {
        connect_error(
            last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "connection failed".to_string()),
        )
    })?;
    tcp.set_read_timeout(Some(Duration::from_secs(20))).ok();
    tcp.set_write_timeout(Some(Duration::from_secs(20))).ok();
    let mut session =
        Session::new().map_err(|err| connect_error(format!("failed to create session: {err}")))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis().min(u128::from(u32::MAX)) as u32);
    session
        .handshake()
        .map_err(|err| connect_error(format!("SSH handshake failed: {err}")))?;
    Ok(session)
}

pub fn fingerprint_sha256(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    let b64 = STANDARD_NO_PAD.encode(digest);
    format!("SHA256:{b64}")
}

pub fn host_key_type_to_name(key_type: HostKeyType) -> &'static str {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        HostKeyType::Unknown => "unknown",
    }
}

fn known_hosts_host(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

pub fn known_hosts_entry(host: &str, port: u16, algo: &str, key: &[u8]) -> String {
    let key_b64 = STANDARD.encode(key);
    format!("{} {algo} {key_b64}", known_hosts_host(host, port))
}

fn ensure_parent_dir(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|err| format!("failed to create {}: {err}", parent.display()))?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct HostKeyScan {
    pub host: String,
    pub port: u16,
    pub key_type: String,
    pub fingerprint_sha256: String,
    pub known_hosts_entry: String,
}

pub fn scan_host_key(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<HostKeyScan, TransportError> {
    let session = handshake_ssh(host, port, timeout)?;
    let (host_key, host_key_type) = session.host_key().ok_or_else(|| TransportError::HostKey {
        host: host.to_string(),
        message: "SSH host key unavailable".to_string(),
    })?;
    let algo = host_key_type_to_name(host_key_type);
    Ok(HostKeyScan {
        host: host.to_string(),
        port,
        key_type: algo.to_string(),
        fingerprint_sha256: fingerprint_sha256(host_key),
        known_hosts_entry: known_hosts_entry(host, port, algo, host_key),
    })
}
