//! Remote execution seam.
//!
//! The sequencer only ever talks to devices through [`Transport`] and
//! [`RemoteSession`], so the whole bootstrap flow can be exercised against
//! the in-memory transport in `mock` without a network.

#[cfg(test)]
pub mod mock;
pub mod ssh;

use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::util::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethodKind {
    Key,
    Password,
}

impl fmt::Display for AuthMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Key => "key",
            Self::Password => "password",
        })
    }
}

pub enum AuthMethod<'a> {
    Key {
        private_key: &'a Path,
        public_key: Option<&'a Path>,
    },
    Password(&'a str),
}

impl AuthMethod<'_> {
    pub fn kind(&self) -> AuthMethodKind {
        match self {
            Self::Key { .. } => AuthMethodKind::Key,
            Self::Password(_) => AuthMethodKind::Password,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {host}:{port} failed: {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
    },
    #[error("host key verification failed for {host}: {message}")]
    HostKey { host: String, message: String },
    #[error("{method} authentication as {user} rejected: {message}")]
    Auth {
        user: String,
        method: AuthMethodKind,
        message: String,
    },
    #[error("key and password authentication as {user}@{host} both failed ({detail})")]
    AuthExhausted {
        user: String,
        host: String,
        detail: String,
    },
    #[error("remote channel error: {0}")]
    Channel(String),
    #[error("upload to {path} failed: {message}")]
    Upload { path: String, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined(&self) -> String {
        if self.stderr.trim().is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// An authenticated session to one device.
pub trait RemoteSession: Send {
    fn exec(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError>;

    fn upload(&mut self, remote_path: &str, contents: &[u8], mode: i32)
        -> Result<(), TransportError>;
}

pub trait Transport: Send + Sync {
    fn connect(
        &self,
        target: &SshTarget,
        auth: &AuthMethod<'_>,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Root,
}

/// The exact command line sent to the device for `command`.
///
/// Root commands go through `sudo -S` with the password on stdin when one is
/// known, and through non-interactive `sudo -n` otherwise.
pub fn render_command(command: &str, privilege: Privilege, sudo_password: Option<&str>) -> String {
    match privilege {
        Privilege::User => command.to_string(),
        Privilege::Root if has_password(sudo_password) => {
            format!("sudo -S -p '' bash -c {}", shell_quote(command))
        }
        Privilege::Root => format!("sudo -n bash -c {}", shell_quote(command)),
    }
}

pub fn run_remote(
    session: &mut dyn RemoteSession,
    command: &str,
    privilege: Privilege,
    sudo_password: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, TransportError> {
    let rendered = render_command(command, privilege, sudo_password);
    let stdin = match (privilege, sudo_password) {
        (Privilege::Root, Some(password)) if has_password(Some(password)) => {
            Some(format!("{password}\n"))
        }
        _ => None,
    };
    session.exec(&rendered, stdin.as_deref().map(str::as_bytes), timeout)
}

fn has_password(password: Option<&str>) -> bool {
    password.is_some_and(|value| !value.trim().is_empty())
}
