use {
    anyhow::Result,
    backlog_oauth::{AuthorizationBroker, CredentialState, Credentials, OAuthError},
    chrono::Utc,
    clap::Subcommand,
    tracing::warn,
};

use crate::config::Settings;

#[derive(Subcommand)]
pub enum AuthAction {
    /// Log in via the browser, or refresh an expired session.
    Login {
        /// Discard cached credentials and go through consent again.
        #[arg(long)]
        force: bool,
    },
    /// Show the state of the cached credentials.
    Status,
    /// Forget the cached credentials.
    Logout,
    /// Print a currently valid access token.
    Token,
}

pub async fn handle_auth(action: AuthAction, settings: Settings) -> Result<()> {
    let broker = AuthorizationBroker::system().with_options(settings.options.clone());
    match action {
        AuthAction::Login { force } => login(&broker, &settings, force).await,
        AuthAction::Status => status(&broker, &settings).await,
        AuthAction::Logout => logout(&broker, &settings).await,
        AuthAction::Token => token(&broker, &settings).await,
    }
}

/// Credentials from the broker, tolerating a failed cache write.
async fn valid_credentials(
    broker: &AuthorizationBroker,
    settings: &Settings,
) -> Result<Credentials> {
    match broker
        .get_valid_credentials(&settings.app, &settings.endpoints)
        .await
    {
        Ok(c) => Ok(c),
        Err(e @ OAuthError::Persist { .. }) => {
            warn!(error = %e, "credentials obtained but not cached");
            e.into_credentials()
                .ok_or_else(|| anyhow::anyhow!("credentials missing from persist error"))
        },
        Err(e) => Err(e.into()),
    }
}

async fn login(broker: &AuthorizationBroker, settings: &Settings, force: bool) -> Result<()> {
    if force {
        broker.clear(&settings.app).await?;
    }
    eprintln!("Opening browser for authentication if needed...");
    let credentials = valid_credentials(broker, settings).await?;
    eprintln!("Logged in [{}]", describe(&credentials));
    Ok(())
}

async fn status(broker: &AuthorizationBroker, settings: &Settings) -> Result<()> {
    let path = settings.app.credentials_cache_path.display();
    match broker.cached(&settings.app).await {
        Some(credentials) => println!("{path} [{}]", describe(&credentials)),
        None => println!("{path} [not logged in]"),
    }
    Ok(())
}

async fn logout(broker: &AuthorizationBroker, settings: &Settings) -> Result<()> {
    broker.clear(&settings.app).await?;
    println!("Logged out");
    Ok(())
}

async fn token(broker: &AuthorizationBroker, settings: &Settings) -> Result<()> {
    let credentials = valid_credentials(broker, settings).await?;
    println!("{}", credentials.access_token);
    Ok(())
}

fn describe(credentials: &Credentials) -> String {
    let now = Utc::now();
    match (credentials.state(now), credentials.remaining(now)) {
        (CredentialState::Valid, Some(remaining)) => {
            let secs = remaining.as_secs();
            format!("valid ({}h {}m remaining)", secs / 3600, (secs % 3600) / 60)
        },
        (CredentialState::Valid, None) | (CredentialState::Expired, _) => {
            "expired, will refresh on next use".to_string()
        },
        (CredentialState::NoCredentials, _) => "unusable, login required".to_string(),
    }
}
