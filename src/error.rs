use thiserror::Error;

/// Convenience type alias for Results with AwcpError
pub type Result<T> = std::result::Result<T, AwcpError>;

/// Main error type for the control plane.
///
/// Variants correspond to the error kinds raised at component boundaries:
/// malformed input, ownership-policy denial, missing credentials, a
/// dependency being unreachable, a missing entity, or a tamper/integrity
/// failure. The remaining variants are plumbing from the ambient stack
/// (serialization, configuration, anything wrapped from `anyhow`).
#[derive(Error, Debug)]
pub enum AwcpError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AwcpError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn denied(msg: impl Into<String>) -> Self {
        Self::PolicyDenied(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
