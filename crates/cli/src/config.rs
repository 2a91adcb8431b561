//! `backlog.toml` loading.
//!
//! Values come from, in order of precedence: command-line flags (which also
//! read `BACKLOG_*` environment variables), the config file, then defaults.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    anyhow::{Context, Result},
    backlog_oauth::{AppRegistration, AuthorizationEndpoints, BrokerOptions},
    secrecy::SecretString,
    serde::Deserialize,
};

pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8765/callback";
pub const DEFAULT_AUTH_RESOURCE: &str = "/OAuth2AccessRequest.action";
pub const DEFAULT_TOKEN_RESOURCE: &str = "/api/v2/oauth2/token";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BacklogConfig {
    pub oauth: OAuthSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OAuthSection {
    pub space_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub redirect_uri: Option<String>,
    pub auth_resource: Option<String>,
    pub token_resource: Option<String>,
    pub credentials_cache_path: Option<PathBuf>,
    pub callback_timeout_secs: Option<u64>,
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Default)]
pub struct Overrides {
    pub space_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub credentials_cache_path: Option<PathBuf>,
}

/// Everything the broker needs for one app registration.
#[derive(Debug)]
pub struct Settings {
    pub app: AppRegistration,
    pub endpoints: AuthorizationEndpoints,
    pub options: BrokerOptions,
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "backlog", "backlog")
}

pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("backlog.toml"))
}

pub fn default_cache_path() -> Result<PathBuf> {
    let dirs = project_dirs().context("could not determine a data directory")?;
    Ok(dirs.data_dir().join("credentials.json"))
}

impl BacklogConfig {
    /// Load `path`, or the default location when `None`. A missing default
    /// file is an empty config; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn resolve(self, overrides: Overrides) -> Result<Settings> {
        let oauth = self.oauth;

        let space_url = overrides
            .space_url
            .or(oauth.space_url)
            .context("space URL not configured (set --space-url or BACKLOG_SPACE_URL)")?;
        let client_id = overrides
            .client_id
            .or(oauth.client_id)
            .context("client id not configured (set --client-id or BACKLOG_CLIENT_ID)")?;
        let client_secret = overrides
            .client_secret
            .map(SecretString::new)
            .or(oauth.client_secret)
            .context("client secret not configured (set BACKLOG_CLIENT_SECRET)")?;
        let credentials_cache_path = match overrides
            .credentials_cache_path
            .or(oauth.credentials_cache_path)
        {
            Some(p) => p,
            None => default_cache_path()?,
        };

        let mut options = BrokerOptions::default();
        if let Some(secs) = oauth.callback_timeout_secs {
            options.callback_timeout = Duration::from_secs(secs);
        }

        Ok(Settings {
            app: AppRegistration {
                client_id,
                client_secret,
                redirect_uri: oauth
                    .redirect_uri
                    .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
                credentials_cache_path,
            },
            endpoints: AuthorizationEndpoints {
                base_uri: space_url,
                auth_resource: oauth
                    .auth_resource
                    .unwrap_or_else(|| DEFAULT_AUTH_RESOURCE.to_string()),
                token_resource: oauth
                    .token_resource
                    .unwrap_or_else(|| DEFAULT_TOKEN_RESOURCE.to_string()),
            },
            options,
        })
    }
}
