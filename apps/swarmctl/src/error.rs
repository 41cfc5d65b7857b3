use thiserror::Error;

use crate::steps::BootstrapStep;
use crate::transport::TransportError;

/// Failure taxonomy for a fleet run.
///
/// `Input` and `Credential` abort the run before any device work is
/// dispatched. Everything else is scoped to one device and never stops the
/// other workers. `Precondition` is a step that cannot run on a device
/// because run-wide material it needs (join token, storage server, key or
/// certificate) is missing.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("no usable credentials: {0}")]
    Credential(String),
    #[error("cannot run: {0}")]
    Precondition(String),
    #[error("{device}: unreachable ({message})")]
    Probe { device: String, message: String },
    #[error("{device}: {step} failed: {message}")]
    Step {
        device: String,
        step: BootstrapStep,
        message: String,
        exit_code: Option<i32>,
    },
    #[error("{tool} exited with status {exit_code}: {output}")]
    RemoteTool {
        tool: String,
        exit_code: i32,
        output: String,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type BootstrapResult<T> = Result<T, BootstrapError>;

impl BootstrapError {
    /// Wraps a device-scoped failure with the device and step it happened in.
    pub fn step(device: &str, step: BootstrapStep, cause: BootstrapError) -> Self {
        if let BootstrapError::Step { .. } = cause {
            return cause;
        }
        let exit_code = cause.exit_code();
        BootstrapError::Step {
            device: device.to_string(),
            step,
            message: cause.to_string(),
            exit_code,
        }
    }

    /// Exit status of the underlying remote tool, when one ran.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            BootstrapError::RemoteTool { exit_code, .. } => Some(*exit_code),
            BootstrapError::Step { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BootstrapError::Input(_) | BootstrapError::Credential(_))
    }
}
