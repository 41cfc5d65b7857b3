//! Bootstrap steps, the order they run in, and the remote commands behind
//! each one.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::certs::{
    certbot_command, certificate_paths, link_letsencrypt_command, CertificateBundle,
    LetsEncryptRequest, CERT_DIR,
};
use crate::error::{BootstrapError, BootstrapResult};
use crate::swarm::SwarmJoiner;
use crate::transport::Privilege;
use crate::util::shell_quote;

/// Declaration order is execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapStep {
    InstallKey,
    InstallPackages,
    MountStorage,
    JoinSwarm,
    IssueCertificate,
}

impl BootstrapStep {
    pub const ALL: [BootstrapStep; 5] = [
        BootstrapStep::InstallKey,
        BootstrapStep::InstallPackages,
        BootstrapStep::MountStorage,
        BootstrapStep::JoinSwarm,
        BootstrapStep::IssueCertificate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstallKey => "install-key",
            Self::InstallPackages => "install-packages",
            Self::MountStorage => "mount-storage",
            Self::JoinSwarm => "join-swarm",
            Self::IssueCertificate => "issue-certificate",
        }
    }
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum StepSet {
    #[default]
    Full,
    KeysOnly,
    Packages,
    StorageOnly,
    SwarmOnly,
    CertsOnly,
}

impl StepSet {
    pub fn steps(self) -> Vec<BootstrapStep> {
        match self {
            Self::Full => BootstrapStep::ALL.to_vec(),
            Self::KeysOnly => vec![BootstrapStep::InstallKey],
            Self::Packages => vec![BootstrapStep::InstallPackages],
            Self::StorageOnly => vec![BootstrapStep::MountStorage],
            Self::SwarmOnly => vec![BootstrapStep::JoinSwarm],
            Self::CertsOnly => vec![BootstrapStep::IssueCertificate],
        }
    }
}

/// Sorts a selection into canonical order and prepends `InstallKey`.
///
/// An empty selection stays empty.
pub fn normalize_plan<I>(selection: I) -> Vec<BootstrapStep>
where
    I: IntoIterator<Item = BootstrapStep>,
{
    let mut steps: BTreeSet<BootstrapStep> = selection.into_iter().collect();
    if !steps.is_empty() {
        steps.insert(BootstrapStep::InstallKey);
    }
    steps.into_iter().collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    pub server: String,
    pub volume: String,
    pub mount_point: String,
}

impl StorageTarget {
    pub fn source(&self) -> String {
        format!("{}:/{}", self.server, self.volume)
    }
}

#[derive(Debug, Clone)]
pub struct CertificatePlan {
    /// File stem under the certificate directory.
    pub name: String,
    pub letsencrypt: Option<LetsEncryptRequest>,
    pub self_signed: Option<CertificateBundle>,
}

/// Run-wide inputs shared read-only by every device worker.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub ssh_user: String,
    pub public_key: Option<String>,
    pub packages: Vec<String>,
    pub storage: Option<StorageTarget>,
    pub swarm: Arc<SwarmJoiner>,
    pub certificate: CertificatePlan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCheck {
    pub command: String,
    pub privilege: Privilege,
}

#[derive(Clone)]
pub enum RemoteAction {
    Exec {
        command: String,
        /// What gets logged. Differs from `command` when it carries a secret.
        display: String,
        privilege: Privilege,
        tool: &'static str,
    },
    Upload {
        remote_path: String,
        contents: Vec<u8>,
        mode: i32,
    },
}

impl RemoteAction {
    fn root(tool: &'static str, command: String) -> Self {
        RemoteAction::Exec {
            display: command.clone(),
            command,
            privilege: Privilege::Root,
            tool,
        }
    }

    fn user(tool: &'static str, command: String) -> Self {
        RemoteAction::Exec {
            display: command.clone(),
            command,
            privilege: Privilege::User,
            tool,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            RemoteAction::Exec { display, .. } => display.clone(),
            RemoteAction::Upload { remote_path, .. } => format!("upload {remote_path}"),
        }
    }
}

impl fmt::Debug for RemoteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Actions for a step. `fallback` runs only when `primary` fails.
#[derive(Debug, Clone)]
pub struct StepActions {
    pub primary: Vec<RemoteAction>,
    pub fallback: Option<Vec<RemoteAction>>,
}

impl StepActions {
    fn only(primary: Vec<RemoteAction>) -> Self {
        Self {
            primary,
            fallback: None,
        }
    }
}

const AUTHORIZED_KEYS: &str = "~/.ssh/authorized_keys";
const SWARM_ACTIVE_CHECK: &str =
    "docker info --format '{{.Swarm.LocalNodeState}}' 2>/dev/null | grep -qx active";

impl StepContext {
    /// Remote predicate that is true when the step has nothing left to do.
    pub fn check(&self, step: BootstrapStep) -> BootstrapResult<RemoteCheck> {
        let check = match step {
            BootstrapStep::InstallKey => RemoteCheck {
                command: format!(
                    "grep -qxF {} {AUTHORIZED_KEYS}",
                    shell_quote(self.require_public_key()?)
                ),
                privilege: Privilege::User,
            },
            BootstrapStep::InstallPackages => RemoteCheck {
                command: packages_installed_check(&self.packages),
                privilege: Privilege::User,
            },
            BootstrapStep::MountStorage => RemoteCheck {
                command: format!(
                    "mountpoint -q {}",
                    shell_quote(&self.require_storage()?.mount_point)
                ),
                privilege: Privilege::User,
            },
            BootstrapStep::JoinSwarm => RemoteCheck {
                command: SWARM_ACTIVE_CHECK.to_string(),
                privilege: Privilege::Root,
            },
            BootstrapStep::IssueCertificate => {
                let (crt, key) = certificate_paths(&self.certificate.name);
                RemoteCheck {
                    command: format!(
                        "test -s {} && test -s {}",
                        shell_quote(&crt),
                        shell_quote(&key)
                    ),
                    privilege: Privilege::Root,
                }
            }
        };
        Ok(check)
    }

    pub fn actions(&self, step: BootstrapStep) -> BootstrapResult<StepActions> {
        match step {
            BootstrapStep::InstallKey => {
                let key = shell_quote(self.require_public_key()?);
                Ok(StepActions::only(vec![RemoteAction::user(
                    "sh",
                    format!(
                        "install -d -m 700 ~/.ssh && touch {AUTHORIZED_KEYS} \
                          && chmod 600 {AUTHORIZED_KEYS} \
                          && (grep -qxF {key} {AUTHORIZED_KEYS} \
                          || printf '%s\\n' {key} >> {AUTHORIZED_KEYS})"
                    ),
                )]))
            }
            BootstrapStep::InstallPackages => Ok(StepActions::only(self.package_actions())),
            BootstrapStep::MountStorage => {
                let storage = self.require_storage()?;
                Ok(StepActions::only(mount_actions(storage)))
            }
            BootstrapStep::JoinSwarm => {
                let join = self.swarm.join()?;
                Ok(StepActions::only(vec![RemoteAction::Exec {
                    command: join.command(),
                    display: join.redacted_command(),
                    privilege: Privilege::Root,
                    tool: "docker",
                }]))
            }
            BootstrapStep::IssueCertificate => self.certificate_actions(),
        }
    }

    fn require_public_key(&self) -> BootstrapResult<&str> {
        self.public_key.as_deref().ok_or_else(|| {
            BootstrapError::Precondition(
                "no local public key to install; run `swarmctl keygen` first".to_string(),
            )
        })
    }

    fn require_storage(&self) -> BootstrapResult<&StorageTarget> {
        self.storage.as_ref().ok_or_else(|| {
            BootstrapError::Precondition(
                "no storage server configured (set storage.server or swarm.manager)".to_string(),
            )
        })
    }

    fn package_actions(&self) -> Vec<RemoteAction> {
        if self.packages.is_empty() {
            return Vec::new();
        }
        let packages: Vec<String> = self.packages.iter().map(|p| shell_quote(p)).collect();
        let user = shell_quote(&self.ssh_user);
        vec![
            RemoteAction::root("apt-get", "apt-get update".to_string()),
            RemoteAction::root(
                "apt-get",
                format!(
                    "DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
                    packages.join(" ")
                ),
            ),
            RemoteAction::root(
                "usermod",
                format!("if getent group docker >/dev/null; then usermod -aG docker {user}; fi"),
            ),
        ]
    }

    fn certificate_actions(&self) -> BootstrapResult<StepActions> {
        let plan = &self.certificate;
        let self_signed = match &plan.self_signed {
            Some(bundle) => self_signed_actions(&plan.name, bundle),
            None => {
                return Err(BootstrapError::Precondition(
                    "no self-signed certificate material was generated for this run".to_string(),
                ))
            }
        };
        Ok(match &plan.letsencrypt {
            Some(request) => StepActions {
                primary: vec![
                    RemoteAction::root("certbot", certbot_command(request)),
                    RemoteAction::root("ln", link_letsencrypt_command(request, &plan.name)),
                ],
                fallback: Some(self_signed),
            },
            None => StepActions::only(self_signed),
        })
    }
}

fn packages_installed_check(packages: &[String]) -> String {
    if packages.is_empty() {
        return "true".to_string();
    }
    packages
        .iter()
        .map(|pkg| {
            format!(
                "dpkg-query -W -f='${{Status}}' {} 2>/dev/null | grep -q 'install ok installed'",
                shell_quote(pkg)
            )
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

fn mount_actions(storage: &StorageTarget) -> Vec<RemoteAction> {
    let source = storage.source();
    let fstab_line = format!("{source} {} glusterfs defaults,_netdev 0 0", storage.mount_point);
    vec![
        RemoteAction::root(
            "install",
            format!("install -d -m 755 {}", shell_quote(&storage.mount_point)),
        ),
        RemoteAction::root(
            "sh",
            format!(
                "grep -qsF {line} /etc/fstab || printf '%s\\n' {line} >> /etc/fstab",
                line = shell_quote(&fstab_line)
            ),
        ),
        RemoteAction::root(
            "mount",
            format!(
                "mount -t glusterfs {} {}",
                shell_quote(&source),
                shell_quote(&storage.mount_point)
            ),
        ),
    ]
}

fn self_signed_actions(name: &str, bundle: &CertificateBundle) -> Vec<RemoteAction> {
    let (crt, key) = certificate_paths(name);
    let staged_crt = format!("/tmp/piswarm-{name}.crt");
    let staged_key = format!("/tmp/piswarm-{name}.key");
    vec![
        RemoteAction::Upload {
            remote_path: staged_crt.clone(),
            contents: bundle.cert_pem.clone().into_bytes(),
            mode: 0o644,
        },
        RemoteAction::Upload {
            remote_path: staged_key.clone(),
            contents: bundle.key_pem.expose().as_bytes().to_vec(),
            mode: 0o600,
        },
        RemoteAction::root(
            "install",
            format!(
                "install -d -m 755 {CERT_DIR} && install -m 644 {sc} {crt} \
                  && install -m 600 {sk} {key} && rm -f {sc} {sk}",
                sc = shell_quote(&staged_crt),
                sk = shell_quote(&staged_key),
                crt = shell_quote(&crt),
                key = shell_quote(&key),
            ),
        ),
    ]
}
