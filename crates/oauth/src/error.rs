use std::{io, net::SocketAddr};

use crate::types::Credentials;

/// Errors surfaced by the broker and its components.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// Transport failure talking to the authorization server.
    #[error("network error talking to the authorization server: {0}")]
    Network(#[from] reqwest::Error),

    /// The token endpoint answered with a non-success status.
    #[error("token endpoint returned HTTP {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    /// Success status but no usable token in the body.
    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),

    /// The user (or server) denied consent on the redirect.
    #[error("authorization declined: {error}{}", .description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    Declined {
        error: String,
        description: Option<String>,
    },

    #[error("malformed authorization redirect: {0}")]
    MalformedRedirect(String),

    #[error("authorization redirect state did not match this session")]
    StateMismatch,

    #[error("authorization was cancelled")]
    Cancelled,

    #[error("timed out waiting for the authorization redirect")]
    TimedOut,

    /// The loopback port could not be bound.
    #[error("failed to bind redirect listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid redirect uri: {0}")]
    InvalidRedirectUri(String),

    #[error("invalid authorization endpoint: {0}")]
    InvalidEndpoint(String),

    /// Saving the cache failed. The credentials were still obtained and may be
    /// used for the current call.
    #[error("failed to persist credentials: {source}")]
    Persist {
        credentials: Box<Credentials>,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl OAuthError {
    /// Transient failures the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::TokenEndpoint { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The server refused the grant itself (revoked or expired refresh
    /// token, bad code). Recoverable by starting a new consent flow.
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::TokenEndpoint { status, .. } => (400..500).contains(status),
            Self::InvalidTokenResponse(_) => true,
            _ => false,
        }
    }

    /// Credentials that were obtained before the error happened.
    pub fn into_credentials(self) -> Option<Credentials> {
        match self {
            Self::Persist { credentials, .. } => Some(*credentials),
            _ => None,
        }
    }
}
