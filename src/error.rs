//! Error types for devstack

use thiserror::Error;

/// Result type for devstack operations
pub type Result<T> = std::result::Result<T, StackError>;

/// devstack error types
#[derive(Error, Debug)]
pub enum StackError {
    #[error("No container orchestration runtime is available: {0}")]
    RuntimeUnavailable(String),

    #[error("Unsupported {dialect} version {found} (minimum supported is {minimum})")]
    RuntimeUnsupportedVersion {
        dialect: String,
        found: String,
        minimum: String,
    },

    #[error("Container runtime has not been probed for this invocation")]
    RuntimeNotProbed,

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Stack not found: {0}")]
    StackNotFound(String),

    #[error("Stack already exists: {0}")]
    StackExists(String),

    #[error("Corrupt stack definition at {path}: {reason}")]
    CorruptDefinition { path: String, reason: String },

    #[error("Invalid stack definition: {0}")]
    InvalidDefinition(String),

    #[error("Failed to persist {path}: {source}")]
    PersistenceError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Service '{service}' failed to start: {reason}")]
    StartupFailed { service: String, reason: String },

    #[error("Failed to stop services: {}", .services.join(", "))]
    StopFailed { services: Vec<String> },

    #[error("Stack '{0}' is not running")]
    StackNotRunning(String),

    #[error("Unknown organization: {0}")]
    UnknownOrganization(String),

    #[error("Account '{account}' already exists for organization '{organization}'")]
    DuplicateAccount {
        organization: String,
        account: String,
    },

    #[error("Account provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StackError {
    /// Create a persistence error for a path
    pub fn persistence(path: &std::path::Path, source: std::io::Error) -> Self {
        StackError::PersistenceError {
            path: path.display().to_string(),
            source,
        }
    }

    /// Create a corrupt definition error for a path
    pub fn corrupt(path: &std::path::Path, reason: impl Into<String>) -> Self {
        StackError::CorruptDefinition {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Process exit code for this error kind
    pub fn exit_code(&self) -> i32 {
        match self {
            StackError::RuntimeUnavailable(_)
            | StackError::RuntimeUnsupportedVersion { .. }
            | StackError::RuntimeNotProbed
            | StackError::Runtime(_) => 3,
            StackError::StackNotFound(_) | StackError::StackExists(_) => 4,
            StackError::CorruptDefinition { .. }
            | StackError::InvalidDefinition(_)
            | StackError::PersistenceError { .. } => 5,
            StackError::StartupFailed { .. }
            | StackError::StopFailed { .. }
            | StackError::StackNotRunning(_) => 6,
            StackError::UnknownOrganization(_)
            | StackError::DuplicateAccount { .. }
            | StackError::ProvisionFailed(_) => 7,
            StackError::Cancelled => 130,
            StackError::Config(_) => 2,
        }
    }
}
