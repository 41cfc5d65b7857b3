//! In-memory transport for sequencer tests.
//!
//! Each mock host remembers which idempotency checks are satisfied. A check
//! that fails marks itself pending, and the next successful action run on
//! that host satisfies it, which mirrors "check, then apply" per step.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    AuthMethod, AuthMethodKind, CommandOutput, RemoteSession, SshTarget, Transport,
    TransportError,
};

/// Called with no locks held when a matching action starts.
pub type ActionHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct MockHostState {
    pub accept_key: bool,
    pub accept_password: bool,
    pub key_after_install: bool,
    pub unreachable: bool,
    pub checks: HashSet<String>,
    pub satisfied: HashSet<String>,
    pub pending: Option<String>,
    pub failing: Vec<(String, i32)>,
    /// (needle, exit code, action that clears the failure)
    failing_until: Vec<(String, i32, String)>,
    hooks: Vec<(String, ActionHook)>,
    pub actions: Vec<String>,
    pub uploads: HashMap<String, Vec<u8>>,
    pub connects: Vec<AuthMethodKind>,
}

#[derive(Clone, Default)]
pub struct MockHost {
    state: Arc<Mutex<MockHostState>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepting_password(self) -> Self {
        self.lock().accept_password = true;
        self
    }

    pub fn accepting_key(self) -> Self {
        self.lock().accept_key = true;
        self
    }

    /// Start accepting key auth once `authorized_keys` has been written.
    pub fn key_after_install(self) -> Self {
        self.lock().key_after_install = true;
        self
    }

    pub fn unreachable(self) -> Self {
        self.lock().unreachable = true;
        self
    }

    pub fn with_checks<I, S>(self, checks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock()
            .checks
            .extend(checks.into_iter().map(Into::into));
        self
    }

    /// Any command containing `needle` exits with `exit_code`.
    pub fn failing(self, needle: &str, exit_code: i32) -> Self {
        self.lock().failing.push((needle.to_string(), exit_code));
        self
    }

    /// Every registered check starts out satisfied.
    pub fn already_done(self) -> Self {
        {
            let mut state = self.lock();
            let checks = state.checks.clone();
            state.satisfied.extend(checks);
        }
        self
    }

    /// Commands containing `needle` exit with `exit_code` until an action
    /// containing `cleared_by` has succeeded on this host.
    pub fn failing_until(self, needle: &str, exit_code: i32, cleared_by: &str) -> Self {
        self.lock().failing_until.push((
            needle.to_string(),
            exit_code,
            cleared_by.to_string(),
        ));
        self
    }

    /// Runs `hook` whenever an action containing `needle` starts.
    pub fn on_action(self, needle: &str, hook: ActionHook) -> Self {
        self.lock().hooks.push((needle.to_string(), hook));
        self
    }

    pub fn lock(&self) -> MutexGuard<'_, MockHostState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn actions(&self) -> Vec<String> {
        self.lock().actions.clone()
    }

    pub fn uploaded(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().uploads.get(path).cloned()
    }
}

#[derive(Default)]
pub struct MockTransport {
    hosts: HashMap<String, MockHost>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, address: &str, host: MockHost) -> Self {
        self.hosts.insert(address.to_string(), host);
        self
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        target: &SshTarget,
        auth: &AuthMethod<'_>,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, TransportError> {
        let Some(host) = self.hosts.get(&target.host) else {
            return Err(TransportError::Connect {
                host: target.host.clone(),
                port: target.port,
                message: "no route to host".to_string(),
            });
        };
        let mut state = host.lock();
        state.connects.push(auth.kind());
        if state.unreachable {
            return Err(TransportError::Connect {
                host: target.host.clone(),
                port: target.port,
                message: "connection refused".to_string(),
            });
        }
        let accepted = match auth {
            AuthMethod::Key { .. } => state.accept_key,
            AuthMethod::Password(_) => state.accept_password,
        };
        if !accepted {
            return Err(TransportError::Auth {
                user: target.username.clone(),
                method: auth.kind(),
                message: "permission denied".to_string(),
            });
        }
        drop(state);
        Ok(Box::new(MockSession { host: host.clone() }))
    }
}

struct MockSession {
    host: MockHost,
}

impl MockSession {
    fn record_action(state: &mut MockHostState, action: String) {
        if state.key_after_install && action.contains("authorized_keys") {
            state.accept_key = true;
        }
        state.actions.push(action);
        if let Some(check) = state.pending.take() {
            state.satisfied.insert(check);
        }
    }
}

impl RemoteSession for MockSession {
    fn exec(
        &mut self,
        command: &str,
        _stdin: Option<&[u8]>,
        _timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let hooks: Vec<ActionHook> = {
            let mut state = self.host.lock();
            if state.checks.contains(command) {
                let satisfied = state.satisfied.contains(command);
                if !satisfied {
                    state.pending = Some(command.to_string());
                }
                return Ok(CommandOutput {
                    exit_code: if satisfied { 0 } else { 1 },
                    ..CommandOutput::default()
                });
            }
            state
                .hooks
                .iter()
                .filter(|(needle, _)| command.contains(needle.as_str()))
                .map(|(_, hook)| hook.clone())
                .collect()
        };
        for hook in hooks {
            hook();
        }

        let mut state = self.host.lock();
        let blocked = state
            .failing_until
            .iter()
            .find(|(needle, _, cleared_by)| {
                command.contains(needle.as_str())
                    && !state.actions.iter().any(|a| a.contains(cleared_by.as_str()))
            })
            .map(|(_, code, _)| *code);
        let failure = state
            .failing
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, code)| *code)
            .or(blocked);
        if let Some(exit_code) = failure {
            state.actions.push(command.to_string());
            return Ok(CommandOutput {
                exit_code,
                stdout: String::new(),
                stderr: "simulated failure".to_string(),
            });
        }
        Self::record_action(&mut state, command.to_string());
        Ok(CommandOutput {
            exit_code: 0,
            stdout: "ok".to_string(),
            stderr: String::new(),
        })
    }

    fn upload(
        &mut self,
        remote_path: &str,
        contents: &[u8],
        _mode: i32,
    ) -> Result<(), TransportError> {
        let mut state = self.host.lock();
        state
            .uploads
            .insert(remote_path.to_string(), contents.to_vec());
        Self::record_action(&mut state, format!("upload {remote_path}"));
        Ok(())
    }
}
