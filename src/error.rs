//! Errors raised by the service host.

use thiserror::Error;

use crate::abi::MarshalError;
use crate::config::ConfigError;
use crate::runtime::RuntimeError;

/// Failure while executing guest code.
///
/// Every variant names the function involved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuestError {
    #[error("function with name `{0}` is missing")]
    MissingFunction(String),

    #[error("function `{function}` called with mismatched arguments: {reason}")]
    ArgumentMismatch { function: String, reason: String },

    /// Trap or guest ABI violation.
    #[error("function `{function}` failed to execute: {message}")]
    Fault { function: String, message: String },

    /// The guest completed the call and reported an error.
    #[error("function `{function}` returned an error: {message}")]
    Failed { function: String, message: String },
}

impl GuestError {
    pub fn function(&self) -> &str {
        match self {
            GuestError::MissingFunction(function)
            | GuestError::ArgumentMismatch { function, .. }
            | GuestError::Fault { function, .. }
            | GuestError::Failed { function, .. } => function,
        }
    }
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to initialize the control runtime: {0}")]
    Init(#[source] RuntimeError),

    #[error("service host is already initialized")]
    AlreadyInitialized,

    #[error("service host is not initialized")]
    NotInitialized,

    #[error("service host is terminated")]
    Terminated,

    #[error("execution context is gone")]
    ContextLost,

    #[error("failed to start execution context: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("invalid service configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to register service `{service_id}`: {source}")]
    Registration {
        service_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("service with id `{0}` not found")]
    ServiceNotFound(String),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Guest(#[from] GuestError),

    #[error("control runtime error: {0}")]
    Runtime(#[source] RuntimeError),
}

impl From<RuntimeError> for HostError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Guest(guest) => HostError::Guest(guest),
            other => HostError::Runtime(other),
        }
    }
}
