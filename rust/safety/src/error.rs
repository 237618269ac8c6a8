use thiserror::Error;
use tonic::Status;

/// Core error type for the mock microVM service
#[derive(Error, Debug)]
pub enum SafetyError {
    /// The uid source could not produce an identifier
    #[error("failed to generate microvm uid: {0}")]
    IdentifierGeneration(String),

    /// Lookup of an unknown uid
    #[error("microvm not found: {uid}")]
    NotFound { uid: String },

    /// Credential present but rejected by the auth gate
    #[error("invalid auth token: {0}")]
    Unauthenticated(String),

    /// Credential missing or not in `Basic <token>` form
    #[error("could not extract token from request header: {0}")]
    MetadataExtraction(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Listener and transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for store and server operations
pub type SafetyResult<T> = Result<T, SafetyError>;

impl From<std::io::Error> for SafetyError {
    fn from(err: std::io::Error) -> Self {
        SafetyError::Transport(err.to_string())
    }
}

impl From<tonic::transport::Error> for SafetyError {
    fn from(err: tonic::transport::Error) -> Self {
        SafetyError::Transport(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for SafetyError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SafetyError::InternalError(format!("Lock poisoned: {err}"))
    }
}

impl From<SafetyError> for Status {
    fn from(err: SafetyError) -> Self {
        let message = err.to_string();
        match err {
            SafetyError::NotFound { .. } => Status::not_found(message),
            // A missing header is reported with the same code as a bad token so
            // clients only have to handle one rejection path.
            SafetyError::Unauthenticated(_) | SafetyError::MetadataExtraction(_) => {
                Status::unauthenticated(message)
            }
            SafetyError::InvalidRequest(_) => Status::invalid_argument(message),
            SafetyError::Transport(_) => Status::unavailable(message),
            SafetyError::IdentifierGeneration(_)
            | SafetyError::ConfigurationError(_)
            | SafetyError::InternalError(_)
            | SafetyError::Other(_) => Status::internal(message),
        }
    }
}
