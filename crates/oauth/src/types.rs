use std::{fmt, path::PathBuf, time::Duration};

use {
    chrono::{DateTime, TimeDelta, Utc},
    secrecy::SecretString,
    serde::{Deserialize, Serialize},
};

use crate::error::OAuthError;

/// Application registration with the authorization server.
///
/// One registration owns one credential cache; `credentials_cache_path` is the
/// key the broker serializes on.
#[derive(Debug, Clone, Deserialize)]
pub struct AppRegistration {
    pub client_id: String,
    pub client_secret: SecretString,
    /// Loopback redirect URI, e.g. `http://127.0.0.1:8765/callback`. Port `0`
    /// asks the OS for an ephemeral port.
    pub redirect_uri: String,
    pub credentials_cache_path: PathBuf,
}

/// Authorization server endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationEndpoints {
    pub base_uri: String,
    /// Resource of the consent step, relative to `base_uri`.
    pub auth_resource: String,
    /// Resource of the token exchange, relative to `base_uri`.
    pub token_resource: String,
}

impl AuthorizationEndpoints {
    pub fn authorize_url(&self) -> Result<url::Url, OAuthError> {
        self.join(&self.auth_resource)
    }

    pub fn token_url(&self) -> Result<url::Url, OAuthError> {
        self.join(&self.token_resource)
    }

    fn join(&self, resource: &str) -> Result<url::Url, OAuthError> {
        let raw = format!(
            "{}/{}",
            self.base_uri.trim_end_matches('/'),
            resource.trim_start_matches('/')
        );
        url::Url::parse(&raw).map_err(|e| OAuthError::InvalidEndpoint(format!("{raw}: {e}")))
    }
}

/// Tunables for the interactive flow.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// How long to wait for the browser redirect before giving up.
    pub callback_timeout: Duration,
    /// Fall back to the consent flow when the server rejects a refresh token.
    pub interactive_fallback: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            callback_timeout: Duration::from_secs(300),
            interactive_fallback: true,
        }
    }
}

/// Snapshot of the tokens issued by the authorization server.
///
/// `expires` is absolute: retrieval time plus the server-reported lifetime.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires: DateTime<Utc>,
}

impl Credentials {
    /// `None` when `now + expires_in` is not representable.
    pub fn from_lifetime(
        access_token: String,
        refresh_token: Option<String>,
        expires_in: i64,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let expires = now.checked_add_signed(TimeDelta::try_seconds(expires_in)?)?;
        Some(Self {
            access_token,
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            expires,
        })
    }

    /// Both tokens must be present; anything less is treated as absent.
    pub fn is_complete(&self) -> bool {
        !self.access_token.is_empty()
            && self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn state(&self, now: DateTime<Utc>) -> CredentialState {
        if !self.is_complete() {
            CredentialState::NoCredentials
        } else if now < self.expires {
            CredentialState::Valid
        } else {
            CredentialState::Expired
        }
    }

    /// Time left before expiry, or `None` once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires - now).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires", &self.expires)
            .finish()
    }
}

/// Where a cached credential set stands relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    NoCredentials,
    Valid,
    Expired,
}
