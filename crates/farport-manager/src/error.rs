use thiserror::Error;

/// Errors returned to command callers.
///
/// None of these are fatal to the dispatcher; a failed command leaves the
/// manager ready for the next one.
#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    #[error("Session '{0}' already exists")]
    AlreadyExists(String),

    #[error("Session '{0}' not found")]
    NotFound(String),

    #[error("Transport configuration error: {0}")]
    TransportConfig(String),

    #[error("Relay session error: {0}")]
    RelaySession(String),

    #[error("Command queue is full")]
    QueueFull,

    #[error("Timed out waiting for the command to resolve")]
    Timeout,

    #[error("Session manager is not running")]
    NotRunning,
}

pub type ManagerResult<T> = Result<T, ManagerError>;
