//! Authorization error types.

use thiserror::Error;

/// Errors from the identity provider.
///
/// "Not a member" is never an error; it is `Ok(false)`.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Transport-level failure talking to the provider.
    #[error("identity provider request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The configured API URL cannot carry a membership path.
    #[error("invalid identity provider url: {0}")]
    InvalidUrl(String),

    /// The provider rejected the access token.
    #[error("access token was rejected by the identity provider")]
    InvalidCredential,

    /// The provider's rate limit is exhausted.
    #[error("identity provider rate limit exceeded while checking '{org}'")]
    RateLimited { org: String, reset_at: Option<u64> },

    /// Any other response the membership endpoint is not documented to return.
    #[error("unexpected response {status} while checking '{org}': {message}")]
    UnexpectedStatus {
        org: String,
        status: u16,
        message: String,
    },
}
