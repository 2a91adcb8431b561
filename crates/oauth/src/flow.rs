use {
    async_trait::async_trait,
    chrono::Utc,
    secrecy::ExposeSecret,
    serde::Deserialize,
    tracing::{debug, info},
};

use crate::{
    error::OAuthError,
    types::{AppRegistration, AuthorizationEndpoints, Credentials},
};

/// Wire exchange with the authorization server's token resource.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Trade an authorization code for a fresh credential set.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        app: &AppRegistration,
        endpoints: &AuthorizationEndpoints,
    ) -> Result<Credentials, OAuthError>;

    /// Trade a refresh token for a fresh credential set.
    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        app: &AppRegistration,
        endpoints: &AuthorizationEndpoints,
    ) -> Result<Credentials, OAuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// `reqwest`-backed token client. Each call is a single POST; nothing is
/// retried here.
#[derive(Debug, Clone, Default)]
pub struct TokenClient {
    client: reqwest::Client,
}

impl TokenClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn request(
        &self,
        endpoints: &AuthorizationEndpoints,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, OAuthError> {
        let url = endpoints.token_url()?;
        let resp = self.client.post(url).form(form).send().await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(OAuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| OAuthError::InvalidTokenResponse(e.to_string()))
    }
}

/// `fallback_refresh` stands in for a refresh token the server did not
/// rotate; without it the response must carry one.
fn into_credentials(
    resp: TokenResponse,
    fallback_refresh: Option<&str>,
) -> Result<Credentials, OAuthError> {
    let access_token = resp
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| OAuthError::InvalidTokenResponse("missing access_token".into()))?;
    let expires_in = resp
        .expires_in
        .ok_or_else(|| OAuthError::InvalidTokenResponse("missing expires_in".into()))?;
    if expires_in <= 0 {
        return Err(OAuthError::InvalidTokenResponse(format!(
            "non-positive expires_in: {expires_in}"
        )));
    }
    let refresh_token = resp
        .refresh_token
        .filter(|t| !t.is_empty())
        .or_else(|| fallback_refresh.map(str::to_string))
        .ok_or_else(|| OAuthError::InvalidTokenResponse("missing refresh_token".into()))?;

    Credentials::from_lifetime(access_token, Some(refresh_token), expires_in, Utc::now())
        .ok_or_else(|| {
            OAuthError::InvalidTokenResponse(format!("expires_in out of range: {expires_in}"))
        })
}

#[async_trait]
impl TokenExchange for TokenClient {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        app: &AppRegistration,
        endpoints: &AuthorizationEndpoints,
    ) -> Result<Credentials, OAuthError> {
        debug!(client_id = %app.client_id, "exchanging authorization code");
        let resp = self
            .request(
                endpoints,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", redirect_uri),
                    ("client_id", app.client_id.as_str()),
                    ("client_secret", app.client_secret.expose_secret().as_str()),
                ],
            )
            .await?;
        let credentials = into_credentials(resp, None)?;
        info!(expires = %credentials.expires, "authorization code exchanged");
        Ok(credentials)
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        app: &AppRegistration,
        endpoints: &AuthorizationEndpoints,
    ) -> Result<Credentials, OAuthError> {
        debug!(client_id = %app.client_id, "refreshing access token");
        let resp = self
            .request(
                endpoints,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", app.client_id.as_str()),
                    ("client_secret", app.client_secret.expose_secret().as_str()),
                ],
            )
            .await?;
        // Servers that do not rotate refresh tokens omit the field.
        let credentials = into_credentials(resp, Some(refresh_token))?;
        info!(expires = %credentials.expires, "access token refreshed");
        Ok(credentials)
    }
}
