//! Error types for the job engine
//!
//! Errors are split by who has to deal with them:
//! - [`ConfigError`]: invalid options, returned before any connection attempt
//! - [`StoreError`]: backing store failures, treated as transient by the loops
//! - [`MessageError`]: payloads that cannot be decoded, logged and dropped
//! - [`JobError`]: what a handler (or a panicking handler) reports to the chain

use thiserror::Error;

/// Invalid engine options
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Options requires a process id, which uniquely identifies this instance")]
    MissingProcessId,

    #[error("Sentinel configuration requires a master name")]
    MissingMasterName,

    #[error("Options requires either a server address or sentinel addresses")]
    MissingServer,

    #[error("Failed to parse environment variable {key}: {details}")]
    ParseError { key: String, details: String },

    #[error("Queue {queue} is already registered")]
    DuplicateQueue { queue: String },
}

/// Backing store failure
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// No sentinel could name the current master
    #[error("No sentinel resolved master {master}")]
    MasterNotFound { master: String },

    /// Failure reported by a non-Redis store
    #[error("Store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// The command hit a client-side response timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Redis(e) if e.is_timeout())
    }

    /// The connection dropped or was refused
    pub fn is_connection_error(&self) -> bool {
        match self {
            StoreError::Redis(e) => e.is_connection_dropped() || e.is_connection_refusal(),
            StoreError::MasterNotFound { .. } => true,
            StoreError::Backend(_) => false,
        }
    }
}

/// A payload that is not a valid job document
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Malformed job payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Failure reported by a job handler.
///
/// A panic inside a handler is converted into [`JobError::Panicked`] carrying
/// the panic message, so outer middleware sees the same text it would have
/// seen had the handler returned the error itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    Panicked(String),
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }

    /// Build the error for a caught panic payload
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "job panicked".to_string()
        };
        JobError::Panicked(message)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, JobError::Panicked(_))
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        JobError::Failed(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        JobError::Failed(message.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Failed(err.to_string())
    }
}

impl From<MessageError> for JobError {
    fn from(err: MessageError) -> Self {
        JobError::Failed(err.to_string())
    }
}

/// Crate level error
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Result type alias for engine operations
pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payloads_keep_their_message() {
        let from_str: Box<dyn std::any::Any + Send> = Box::new("boom");
        let from_string: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        let opaque: Box<dyn std::any::Any + Send> = Box::new(42_u8);

        assert_eq!(JobError::from_panic(from_str.as_ref()).to_string(), "boom");
        assert_eq!(JobError::from_panic(from_string.as_ref()).to_string(), "boom");
        assert_eq!(JobError::from_panic(opaque.as_ref()).to_string(), "job panicked");
    }

    #[test]
    fn test_panic_and_failure_render_identically() {
        let failed = JobError::new("boom");
        let panicked = JobError::Panicked("boom".into());

        assert_eq!(failed.to_string(), panicked.to_string());
        assert!(!failed.is_panic());
        assert!(panicked.is_panic());
    }

    #[test]
    fn test_backend_errors_are_not_connection_errors() {
        let err = StoreError::Backend("nope".into());
        assert!(!err.is_timeout());
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_config_error_messages() {
        assert_eq!(
            ConfigError::MissingMasterName.to_string(),
            "Sentinel configuration requires a master name"
        );
        assert!(ConfigError::MissingProcessId.to_string().contains("process id"));
    }
}
