//! Docker Swarm join material.
//!
//! Workers need the manager address and a worker join token. The token is
//! taken from the config when present; otherwise it is read from the manager
//! over SSH, initializing the swarm there first if it is not active.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::auth::DeviceAuth;
use crate::credentials::{Credentials, Secret};
use crate::error::{BootstrapError, BootstrapResult};
use crate::transport::{run_remote, Privilege, RemoteSession, SshTarget, Transport};
use crate::util::{output_tail, shell_quote};

const MANAGER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct SwarmJoin {
    pub manager: String,
    pub port: u16,
    pub token: Secret,
}

impl SwarmJoin {
    pub fn command(&self) -> String {
        format!(
            "docker swarm join --token {} {}:{}",
            shell_quote(self.token.expose()),
            self.manager,
            self.port
        )
    }

    pub fn redacted_command(&self) -> String {
        format!(
            "docker swarm join --token <redacted> {}:{}",
            self.manager, self.port
        )
    }
}

#[derive(Debug, Clone)]
pub enum SwarmJoinState {
    Ready(SwarmJoin),
    /// Why join material could not be prepared. Join steps fail with this.
    Unavailable(String),
}

/// Reads the worker token from the manager, running `docker swarm init` if
/// the manager is not part of a swarm yet.
pub fn fetch_join_token(
    session: &mut dyn RemoteSession,
    manager: &str,
    sudo_password: Option<&str>,
) -> BootstrapResult<Secret> {
    let state = run_remote(
        session,
        "docker info --format '{{.Swarm.LocalNodeState}}'",
        Privilege::Root,
        sudo_password,
        MANAGER_TIMEOUT,
    )?;
    if !state.success() {
        return Err(BootstrapError::RemoteTool {
            tool: "docker".to_string(),
            exit_code: state.exit_code,
            output: output_tail(&state.combined(), 10),
        });
    }
    if state.stdout.trim() != "active" {
        tracing::info!(manager = %manager, "initializing swarm on manager");
        let init = run_remote(
            session,
            &format!("docker swarm init --advertise-addr {}", shell_quote(manager)),
            Privilege::Root,
            sudo_password,
            MANAGER_TIMEOUT,
        )?;
        if !init.success() {
            return Err(BootstrapError::RemoteTool {
                tool: "docker".to_string(),
                exit_code: init.exit_code,
                output: output_tail(&init.combined(), 10),
            });
        }
    }
    let token = run_remote(
        session,
        "docker swarm join-token -q worker",
        Privilege::Root,
        sudo_password,
        MANAGER_TIMEOUT,
    )?;
    let value = token.stdout.trim();
    if !token.success() || value.is_empty() {
        return Err(BootstrapError::RemoteTool {
            tool: "docker".to_string(),
            exit_code: token.exit_code,
            output: output_tail(&token.combined(), 10),
        });
    }
    Ok(Secret::new(value))
}

#[derive(Debug, Clone)]
pub struct SwarmPrepare {
    pub manager: Option<String>,
    pub join_token: Option<String>,
    pub port: u16,
    pub ssh_port: u16,
    pub connect_timeout: Duration,
}

struct ManagerAccess {
    transport: Arc<dyn Transport>,
    credentials: Arc<Credentials>,
    port: u16,
    ssh_port: u16,
    connect_timeout: Duration,
}

/// Run-wide join material.
///
/// A configured token is used as is. Otherwise the token is read from the
/// manager the first time a device needs it, and that answer (token or
/// failure) is shared by every device for the rest of the run. Callers block
/// while another device is still fetching it.
pub struct SwarmJoiner {
    manager: Option<String>,
    access: Option<ManagerAccess>,
    resolved: OnceLock<SwarmJoinState>,
}

impl SwarmJoiner {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<Credentials>,
        prepare: SwarmPrepare,
    ) -> Self {
        let Some(manager) = non_empty_trimmed(prepare.manager.as_deref()) else {
            return Self::unavailable("no swarm manager configured (swarm.manager)");
        };
        if let Some(token) = non_empty_trimmed(prepare.join_token.as_deref()) {
            return Self::ready(SwarmJoin {
                manager,
                port: prepare.port,
                token: Secret::new(token),
            });
        }
        Self {
            manager: Some(manager),
            access: Some(ManagerAccess {
                transport,
                credentials,
                port: prepare.port,
                ssh_port: prepare.ssh_port,
                connect_timeout: prepare.connect_timeout,
            }),
            resolved: OnceLock::new(),
        }
    }

    pub fn ready(join: SwarmJoin) -> Self {
        Self {
            manager: Some(join.manager.clone()),
            access: None,
            resolved: OnceLock::from(SwarmJoinState::Ready(join)),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            manager: None,
            access: None,
            resolved: OnceLock::from(SwarmJoinState::Unavailable(reason.into())),
        }
    }

    pub fn manager(&self) -> Option<&str> {
        self.manager.as_deref()
    }

    /// The manager address while its token has not been read yet.
    pub fn pending_manager(&self) -> Option<&str> {
        match self.resolved.get() {
            Some(_) => None,
            None => self.manager(),
        }
    }

    pub fn state(&self) -> &SwarmJoinState {
        self.resolved.get_or_init(|| self.fetch_from_manager())
    }

    pub fn join(&self) -> BootstrapResult<&SwarmJoin> {
        match self.state() {
            SwarmJoinState::Ready(join) => Ok(join),
            SwarmJoinState::Unavailable(reason) => Err(BootstrapError::Precondition(format!(
                "swarm join token unavailable: {reason}"
            ))),
        }
    }

    fn fetch_from_manager(&self) -> SwarmJoinState {
        let (Some(manager), Some(access)) = (self.manager(), self.access.as_ref()) else {
            return SwarmJoinState::Unavailable("no swarm manager configured".to_string());
        };
        let target = SshTarget {
            host: manager.to_string(),
            port: access.ssh_port,
            username: access.credentials.username.clone(),
        };
        let mut auth = DeviceAuth::new();
        let result = auth
            .connect(
                access.transport.as_ref(),
                &target,
                &access.credentials,
                access.connect_timeout,
            )
            .map_err(BootstrapError::from)
            .and_then(|mut session| {
                fetch_join_token(session.as_mut(), manager, access.credentials.password())
            });
        match result {
            Ok(token) => {
                tracing::info!(manager = %manager, "obtained swarm join token");
                SwarmJoinState::Ready(SwarmJoin {
                    manager: manager.to_string(),
                    port: access.port,
                    token,
                })
            }
            Err(err) => {
                tracing::warn!(
                    manager = %manager,
                    error = %err,
                    "could not obtain swarm join token"
                );
                SwarmJoinState::Unavailable(format!("manager {manager}: {err}"))
            }
        }
    }
}

impl fmt::Debug for SwarmJoiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmJoiner")
            .field("manager", &self.manager)
            .field("resolved", &self.resolved.get())
            .finish_non_exhaustive()
    }
}

fn non_empty_trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockHost, MockTransport};

    fn credentials() -> Arc<Credentials> {
        Arc::new(Credentials {
            username: "pi".to_string(),
            password: Some(Secret::new("pw")),
            key_path: None,
        })
    }

    fn prepare(manager: Option<&str>, token: Option<&str>) -> SwarmPrepare {
        SwarmPrepare {
            manager: manager.map(str::to_string),
            join_token: token.map(str::to_string),
            port: 2377,
            ssh_port: 22,
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn join_command_redacts_token() {
        let join = SwarmJoin {
            manager: "10.0.0.2".to_string(),
            port: 2377,
            token: Secret::new("SWMTKN-1-abc"),
        };
        assert_eq!(
            join.command(),
            "docker swarm join --token 'SWMTKN-1-abc' 10.0.0.2:2377"
        );
        assert!(!join.redacted_command().contains("SWMTKN"));
        assert!(!format!("{join:?}").contains("SWMTKN"));
    }

    fn joiner(transport: MockTransport, prepare: SwarmPrepare) -> SwarmJoiner {
        SwarmJoiner::new(Arc::new(transport), credentials(), prepare)
    }

    #[test]
    fn configured_token_skips_the_manager() {
        let joiner = joiner(MockTransport::new(), prepare(Some("10.0.0.2"), Some("tok")));
        assert_eq!(joiner.pending_manager(), None);
        assert_eq!(joiner.manager(), Some("10.0.0.2"));
        assert_eq!(joiner.join().expect("join").token.expose(), "tok");
    }

    #[test]
    fn missing_manager_is_a_step_precondition() {
        let joiner = joiner(MockTransport::new(), prepare(None, Some("tok")));
        let err = joiner.join().expect_err("no manager");
        assert!(matches!(err, BootstrapError::Precondition(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn token_is_read_from_the_manager_once_on_first_use() {
        let manager = MockHost::new().accepting_password();
        let joiner = joiner(
            MockTransport::new().with_host("10.0.0.2", manager.clone()),
            prepare(Some("10.0.0.2"), None),
        );
        assert_eq!(joiner.pending_manager(), Some("10.0.0.2"));
        assert!(manager.lock().connects.is_empty());

        // The mock answers "ok" to everything, so the swarm is initialized first.
        assert_eq!(joiner.join().expect("join").token.expose(), "ok");
        let actions = manager.actions();
        assert!(actions.iter().any(|a| a.contains("docker swarm init")));
        assert!(actions.last().is_some_and(|a| a.contains("join-token -q worker")));

        let connects = manager.lock().connects.len();
        assert!(joiner.join().is_ok());
        assert_eq!(manager.lock().connects.len(), connects);
        assert_eq!(joiner.pending_manager(), None);
    }

    #[test]
    fn unreachable_manager_is_unavailable() {
        let joiner = joiner(MockTransport::new(), prepare(Some("10.0.0.2"), None));
        let SwarmJoinState::Unavailable(reason) = joiner.state() else {
            panic!("expected unavailable");
        };
        assert!(reason.contains("10.0.0.2"));
        assert!(!format!("{joiner:?}").contains("SWMTKN"));
    }
}
