use std::io;
use thiserror::Error;

/// Error reported by the cloud provider. `code` is the provider's machine
/// readable error code (e.g. `InvalidPermission.Duplicate`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
}

impl ProviderError {
    pub const DUPLICATE_PERMISSION: &'static str = "InvalidPermission.Duplicate";
    pub const DUPLICATE_GROUP: &'static str = "InvalidGroup.Duplicate";
    pub const DUPLICATE_KEY_PAIR: &'static str = "InvalidKeyPair.Duplicate";
    pub const UNKNOWN: &'static str = "Unknown";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_duplicate_permission(&self) -> bool {
        self.code == Self::DUPLICATE_PERMISSION
    }

    /// The resource we tried to create is already there.
    pub fn is_already_exists(&self) -> bool {
        self.code == Self::DUPLICATE_GROUP || self.code == Self::DUPLICATE_KEY_PAIR
    }
}

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("{kind} not ready after {attempts} polls: {}", pending.join(", "))]
    ResourceNotReady {
        kind: &'static str,
        pending: Vec<String>,
        attempts: u32,
    },

    #[error("cloud provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("remote operation `{op}` failed on {host}: {reason}")]
    RemoteFailure {
        host: String,
        op: String,
        reason: String,
    },

    #[error("{ring} ring has {actual} devices, expected {expected}")]
    RingValidation {
        ring: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid topology: {0}")]
    Topology(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type DeployResult<T> = Result<T, DeployError>;

impl From<DeployError> for io::Error {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}
