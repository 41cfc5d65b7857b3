use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    #[default]
    Unknown,
    KeyOk,
    PasswordOk,
    Failed,
}

impl AuthState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::KeyOk => "key_ok",
            Self::PasswordOk => "password_ok",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fleet member. Lives only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub address: String,
    pub hostname: Option<String>,
    pub reachable: bool,
    pub ssh_port_open: bool,
    pub auth_state: AuthState,
}

impl Device {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            hostname: None,
            reachable: false,
            ssh_port_open: false,
            auth_state: AuthState::Unknown,
        }
    }

    pub fn named(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            hostname: Some(hostname.clone()),
            ..Self::new(hostname)
        }
    }
}
