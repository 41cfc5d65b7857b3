use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::SshSettings;
use crate::error::{BootstrapError, BootstrapResult};
use crate::keys::expand_home;
use crate::util::{non_empty, validate_username};

pub const USER_ENV: &str = "SWARMCTL_SSH_USER";
pub const PASSWORD_ENV: &str = "SWARMCTL_SSH_PASSWORD";
pub const KEY_ENV: &str = "SWARMCTL_SSH_KEY";

/// A string that never shows up in `Debug` output or logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Option<Secret>,
    pub key_path: Option<PathBuf>,
}

impl Credentials {
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(Secret::expose)
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

/// Values given directly on the command line.
#[derive(Debug, Clone, Default)]
pub struct CredentialArgs {
    pub user: Option<String>,
    pub password: Option<Secret>,
    pub key_path: Option<PathBuf>,
}

pub trait Prompter {
    fn username(&mut self) -> anyhow::Result<String>;
    fn password(&mut self, username: &str) -> anyhow::Result<String>;
}

pub struct DialoguerPrompter;

impl Prompter for DialoguerPrompter {
    fn username(&mut self) -> anyhow::Result<String> {
        let value = dialoguer::Input::<String>::new()
            .with_prompt("SSH username")
            .interact_text()?;
        Ok(value)
    }

    fn password(&mut self, username: &str) -> anyhow::Result<String> {
        let value = dialoguer::Password::new()
            .with_prompt(format!("SSH password for {username} (empty for none)"))
            .allow_empty_password(true)
            .interact()?;
        Ok(value)
    }
}

/// Resolves credentials. Each field is taken from the first source that
/// provides a non-empty value: explicit, environment, config, prompt.
///
/// `prompter` is `None` in non-interactive runs. The key path is never
/// prompted for and falls back to `default_key` when that file exists.
pub fn resolve_credentials(
    explicit: &CredentialArgs,
    env: impl Fn(&str) -> Option<String>,
    settings: &SshSettings,
    default_key: Option<PathBuf>,
    mut prompter: Option<&mut dyn Prompter>,
) -> BootstrapResult<Credentials> {
    let username = match non_empty(explicit.user.clone())
        .or_else(|| non_empty(env(USER_ENV)))
        .or_else(|| non_empty(settings.user.clone()))
    {
        Some(user) => user,
        None => match prompter.as_deref_mut() {
            Some(prompter) => non_empty(Some(prompter.username().map_err(prompt_error)?))
                .ok_or_else(|| BootstrapError::Credential("username is required".to_string()))?,
            None => {
                return Err(BootstrapError::Credential(format!(
                    "no SSH username given (use --user, {USER_ENV}, or ssh.user in the config file)"
                )))
            }
        },
    };
    validate_username(&username).map_err(|err| BootstrapError::Credential(err.to_string()))?;
    if username == "root" {
        tracing::warn!("connecting as root; a regular sudo-capable user is recommended");
    }

    let key_path = explicit
        .key_path
        .clone()
        .or_else(|| non_empty(env(KEY_ENV)).map(PathBuf::from))
        .or_else(|| settings.key_path.clone())
        .map(|path| expand_home(&path))
        .or_else(|| default_key.filter(|path| path.exists()));

    let mut password = explicit
        .password
        .clone()
        .filter(|secret| !secret.expose().is_empty())
        .or_else(|| non_empty_raw(env(PASSWORD_ENV)))
        .or_else(|| non_empty_raw(settings.password.clone()));
    if password.is_none() {
        if let Some(prompter) = prompter {
            password = non_empty_raw(Some(prompter.password(&username).map_err(prompt_error)?));
        }
    }

    if password.is_none() && key_path.is_none() {
        return Err(BootstrapError::Credential(format!(
            "neither an SSH key nor a password is available for {username}"
        )));
    }

    let credentials = Credentials {
        username,
        password,
        key_path,
    };
    tracing::debug!(?credentials, "resolved credentials");
    Ok(credentials)
}

// Passwords keep surrounding whitespace; only an empty value counts as absent.
fn non_empty_raw(value: Option<String>) -> Option<Secret> {
    value.filter(|v| !v.is_empty()).map(Secret::new)
}

fn prompt_error(err: anyhow::Error) -> BootstrapError {
    BootstrapError::Credential(format!("prompt failed: {err:#}"))
}
