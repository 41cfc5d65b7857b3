//! Per-device authentication state machine.
//!
//! Every session is opened key first, then password. Each attempt is
//! recorded, including methods that could not be tried because the local
//! material is missing, so a device only reaches [`AuthState::Failed`] after
//! a key attempt followed by a password attempt.

use serde::Serialize;
use std::time::Duration;

use crate::credentials::Credentials;
use crate::device::AuthState;
use crate::keys::public_key_path;
use crate::transport::{
    AuthMethod, AuthMethodKind, RemoteSession, SshTarget, Transport, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    Rejected,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthAttempt {
    pub method: AuthMethodKind,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct DeviceAuth {
    state: AuthState,
    attempts: Vec<AuthAttempt>,
}

impl DeviceAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn attempts(&self) -> &[AuthAttempt] {
        &self.attempts
    }

    pub fn into_attempts(self) -> Vec<AuthAttempt> {
        self.attempts
    }

    fn record(&mut self, method: AuthMethodKind, outcome: AttemptOutcome, detail: Option<String>) {
        self.attempts.push(AuthAttempt {
            method,
            outcome,
            detail,
        });
    }

    /// Opens a session, trying the key and then the password.
    pub fn connect(
        &mut self,
        transport: &dyn Transport,
        target: &SshTarget,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, TransportError> {
        let mut failures = Vec::new();

        match credentials.key_path().filter(|path| path.exists()) {
            Some(private_key) => {
                let public_key = public_key_path(private_key);
                let auth = AuthMethod::Key {
                    private_key,
                    public_key: public_key.exists().then_some(public_key.as_path()),
                };
                match transport.connect(target, &auth, timeout) {
                    Ok(session) => {
                        self.record(AuthMethodKind::Key, AttemptOutcome::Accepted, None);
                        self.state = AuthState::KeyOk;
                        return Ok(session);
                    }
                    Err(err) => {
                        tracing::debug!(
                            device = %target.host,
                            error = %err,
                            "key authentication failed"
                        );
                        failures.push(format!("key: {err}"));
                        self.record(
                            AuthMethodKind::Key,
                            AttemptOutcome::Rejected,
                            Some(err.to_string()),
                        );
                    }
                }
            }
            None => {
                failures.push("key: no local key".to_string());
                self.record(
                    AuthMethodKind::Key,
                    AttemptOutcome::Unavailable,
                    Some("no local key".to_string()),
                );
            }
        }

        match credentials.password() {
            Some(password) => {
                let auth = AuthMethod::Password(password);
                match transport.connect(target, &auth, timeout) {
                    Ok(session) => {
                        self.record(AuthMethodKind::Password, AttemptOutcome::Accepted, None);
                        self.state = AuthState::PasswordOk;
                        return Ok(session);
                    }
                    Err(err) => {
                        tracing::debug!(
                            device = %target.host,
                            error = %err,
                            "password authentication failed"
                        );
                        failures.push(format!("password: {err}"));
                        self.record(
                            AuthMethodKind::Password,
                            AttemptOutcome::Rejected,
                            Some(err.to_string()),
                        );
                    }
                }
            }
            None => {
                failures.push("password: none provided".to_string());
                self.record(
                    AuthMethodKind::Password,
                    AttemptOutcome::Unavailable,
                    Some("no password".to_string()),
                );
            }
        }

        self.state = AuthState::Failed;
        Err(TransportError::AuthExhausted {
            user: target.username.clone(),
            host: target.host.clone(),
            detail: failures.join("; "),
        })
    }
}
