//! Decides, per call, whether cached credentials can be used as-is, need a
//! silent refresh, or require the user to go through consent again.
//!
//! Calls for the same cache path are serialized on a per-path lock held from
//! load to save, so two callers that both see an expired token produce a
//! single refresh and the second one picks up the saved result.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    chrono::Utc,
    dashmap::DashMap,
    rand::Rng,
    tokio::sync::Mutex,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    browser::{BrowserLauncher, SystemBrowser},
    callback_server::CallbackServer,
    error::OAuthError,
    flow::{TokenClient, TokenExchange},
    storage::{CredentialStore, FileCredentialStore},
    types::{AppRegistration, AuthorizationEndpoints, BrokerOptions, CredentialState, Credentials},
};

pub struct AuthorizationBroker {
    store: Arc<dyn CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    browser: Arc<dyn BrowserLauncher>,
    options: BrokerOptions,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl AuthorizationBroker {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        exchange: Arc<dyn TokenExchange>,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            store,
            exchange,
            browser,
            options: BrokerOptions::default(),
            locks: DashMap::new(),
        }
    }

    /// File-backed store, `reqwest` token client and the system browser.
    pub fn system() -> Self {
        Self::new(
            Arc::new(FileCredentialStore::new()),
            Arc::new(TokenClient::new()),
            Arc::new(SystemBrowser),
        )
    }

    pub fn with_options(mut self, options: BrokerOptions) -> Self {
        self.options = options;
        self
    }

    /// Return credentials that are valid right now, refreshing or running the
    /// consent flow as needed.
    pub async fn get_valid_credentials(
        &self,
        app: &AppRegistration,
        endpoints: &AuthorizationEndpoints,
    ) -> Result<Credentials, OAuthError> {
        self.resolve(app, endpoints, None, CancellationToken::new())
            .await
    }

    /// Like [`Self::get_valid_credentials`], but the consent wait ends early
    /// when `cancel` fires.
    pub async fn get_valid_credentials_with_cancel(
        &self,
        app: &AppRegistration,
        endpoints: &AuthorizationEndpoints,
        cancel: CancellationToken,
    ) -> Result<Credentials, OAuthError> {
        self.resolve(app, endpoints, None, cancel).await
    }

    /// Return `current` untouched while it is valid; otherwise refresh it (or
    /// re-authorize) and persist the result.
    pub async fn update_credentials(
        &self,
        current: &Credentials,
        app: &AppRegistration,
        endpoints: &AuthorizationEndpoints,
    ) -> Result<Credentials, OAuthError> {
        if current.state(Utc::now()) == CredentialState::Valid {
            return Ok(current.clone());
        }
        self.resolve(app, endpoints, Some(current), CancellationToken::new())
            .await
    }

    /// Access token ready to be sent as a bearer credential.
    pub async fn access_token(
        &self,
        app: &AppRegistration,
        endpoints: &AuthorizationEndpoints,
    ) -> Result<String, OAuthError> {
        Ok(self.get_valid_credentials(app, endpoints).await?.access_token)
    }

    /// Cached credentials, whatever their state. Never touches the network and
    /// does not wait for an in-flight authorization, since saves replace the
    /// cache atomically.
    pub async fn cached(&self, app: &AppRegistration) -> Option<Credentials> {
        self.store.load(&app.credentials_cache_path)
    }

    /// Forget the cached credentials for `app`.
    ///
    /// Waits for any in-flight call on the same cache path, which may be
    /// sitting in the consent wait for up to `callback_timeout`.
    pub async fn clear(&self, app: &AppRegistration) -> Result<(), OAuthError> {
        let lock = self.lock_for(&app.credentials_cache_path);
        let _guard = lock.lock().await;
        self.store.clear(&app.credentials_cache_path)?;
        info!(path = %app.credentials_cache_path.display(), "cleared cached credentials");
        Ok(())
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks.entry(path.to_path_buf()).or_default().clone()
    }

    async fn resolve(
        &self,
        app: &AppRegistration,
        endpoints: &AuthorizationEndpoints,
        fallback: Option<&Credentials>,
        cancel: CancellationToken,
    ) -> Result<Credentials, OAuthError> {
        let path = &app.credentials_cache_path;
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        let current = self
            .store
            .load(path)
            .filter(Credentials::is_complete)
            .or_else(|| fallback.cloned());
        let state = current
            .as_ref()
            .map_or(CredentialState::NoCredentials, |c| c.state(Utc::now()));

        match (state, current) {
            (CredentialState::Valid, Some(credentials)) => {
                debug!(path = %path.display(), "using cached credentials");
                record("backlog_oauth_cache_hits_total", None);
                return Ok(credentials);
            },
            (CredentialState::Expired, Some(Credentials {
                refresh_token: Some(refresh_token),
                ..
            })) => {
                debug!(path = %path.display(), "cached credentials expired, refreshing");
                match self
                    .exchange
                    .exchange_refresh_token(&refresh_token, app, endpoints)
                    .await
                {
                    Ok(credentials) => {
                        record("backlog_oauth_refresh_total", Some("success"));
                        return self.persist(path, credentials);
                    },
                    Err(e) if e.is_rejection() && self.options.interactive_fallback => {
                        record("backlog_oauth_refresh_total", Some("rejected"));
                        warn!(error = %e, "refresh token rejected, starting a new authorization");
                    },
                    Err(e) => {
                        record("backlog_oauth_refresh_total", Some("failed"));
                        return Err(e);
                    },
                }
            },
            _ => debug!(path = %path.display(), "no usable credentials cached"),
        }

        let credentials = match self.authorize(app, endpoints, cancel).await {
            Ok(c) => {
                record("backlog_oauth_interactive_flows_total", Some("success"));
                c
            },
            Err(e) => {
                record("backlog_oauth_interactive_flows_total", Some("failed"));
                return Err(e);
            },
        };
        self.persist(path, credentials)
    }

    /// Full consent flow: listener, browser, code exchange.
    async fn authorize(
        &self,
        app: &AppRegistration,
        endpoints: &AuthorizationEndpoints,
        cancel: CancellationToken,
    ) -> Result<Credentials, OAuthError> {
        let state = random_state();
        let pending = CallbackServer::start(
            &app.redirect_uri,
            Some(state.clone()),
            cancel,
            self.options.callback_timeout,
        )
        .await?;
        let redirect_uri = pending.redirect_uri().clone();

        let url = authorization_url(app, endpoints, &redirect_uri, &state)?;
        info!(client_id = %app.client_id, "opening browser for authorization");
        self.browser.open(&url);

        let code = pending.wait().await?;
        self.exchange
            .exchange_code(&code, redirect_uri.as_str(), app, endpoints)
            .await
    }

    fn persist(&self, path: &Path, credentials: Credentials) -> Result<Credentials, OAuthError> {
        if credentials.state(Utc::now()) != CredentialState::Valid {
            return Err(OAuthError::InvalidTokenResponse(
                "issued credentials are incomplete or already expired".into(),
            ));
        }
        match self.store.save(path, &credentials) {
            Ok(()) => Ok(credentials),
            Err(source) => {
                warn!(path = %path.display(), error = %source, "failed to persist credentials");
                Err(OAuthError::Persist {
                    credentials: Box::new(credentials),
                    source,
                })
            },
        }
    }
}

/// `base/authResource?response_type=code&client_id=...&redirect_uri=...&state=...`
pub fn authorization_url(
    app: &AppRegistration,
    endpoints: &AuthorizationEndpoints,
    redirect_uri: &Url,
    state: &str,
) -> Result<Url, OAuthError> {
    let mut url = endpoints.authorize_url()?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &app.client_id)
        .append_pair("redirect_uri", redirect_uri.as_str())
        .append_pair("state", state);
    Ok(url)
}

fn random_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(feature = "metrics")]
fn record(name: &'static str, outcome: Option<&'static str>) {
    match outcome {
        Some(outcome) => metrics::counter!(name, "outcome" => outcome).increment(1),
        None => metrics::counter!(name).increment(1),
    }
}

#[cfg(not(feature = "metrics"))]
fn record(_name: &'static str, _outcome: Option<&'static str>) {}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io,
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use {async_trait::async_trait, secrecy::SecretString};

    use super::*;

    // ── Fakes ───────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct MemoryStore {
        entries: StdMutex<HashMap<PathBuf, Credentials>>,
        saves: AtomicUsize,
        fail_saves: bool,
    }

    impl MemoryStore {
        fn with(path: &Path, credentials: Credentials) -> Self {
            let store = Self::default();
            store
                .entries
                .lock()
                .unwrap()
                .insert(path.to_path_buf(), credentials);
            store
        }

        fn get(&self, path: &Path) -> Option<Credentials> {
            self.entries.lock().unwrap().get(path).cloned()
        }
    }

    impl CredentialStore for MemoryStore {
        fn load(&self, path: &Path) -> Option<Credentials> {
            self.get(path)
        }

        fn save(&self, path: &Path, credentials: &Credentials) -> io::Result<()> {
            if self.fail_saves {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.entries
                .lock()
                .unwrap()
                .insert(path.to_path_buf(), credentials.clone());
            Ok(())
        }

        fn clear(&self, path: &Path) -> io::Result<()> {
            self.entries.lock().unwrap().remove(path);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeExchange {
        code_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
        last_code: StdMutex<Option<String>>,
        refresh_error_status: Option<u16>,
        refresh_delay: Duration,
        issued_lifetime: Option<i64>,
    }

    impl FakeExchange {
        fn issued(&self, access: &str) -> Credentials {
            Credentials::from_lifetime(
                access.into(),
                Some(format!("{access}-refresh")),
                self.issued_lifetime.unwrap_or(3600),
                Utc::now(),
            )
            .unwrap()
        }
    }

    #[async_trait]
    impl TokenExchange for FakeExchange {
        async fn exchange_code(
            &self,
            code: &str,
            _redirect_uri: &str,
            _app: &AppRegistration,
            _endpoints: &AuthorizationEndpoints,
        ) -> Result<Credentials, OAuthError> {
            let n = self.code_calls.fetch_add(1, Ordering::SeqCst) + 1;
            *self.last_code.lock().unwrap() = Some(code.to_string());
            Ok(self.issued(&format!("from-code-{n}")))
        }

        async fn exchange_refresh_token(
            &self,
            _refresh_token: &str,
            _app: &AppRegistration,
            _endpoints: &AuthorizationEndpoints,
        ) -> Result<Credentials, OAuthError> {
            let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.refresh_delay).await;
            if let Some(status) = self.refresh_error_status {
                return Err(OAuthError::TokenEndpoint {
                    status,
                    body: r#"{"error":"invalid_grant"}"#.into(),
                });
            }
            Ok(self.issued(&format!("from-refresh-{n}")))
        }
    }

    /// Plays the user: follows the consent URL straight to the redirect.
    #[derive(Default)]
    struct FakeBrowser {
        opens: AtomicUsize,
        deny: bool,
        idle: bool,
    }

    impl BrowserLauncher for FakeBrowser {
        fn open(&self, url: &Url) {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.idle {
                return;
            }
            let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
            let mut redirect = Url::parse(&params["redirect_uri"]).unwrap();
            if self.deny {
                redirect
                    .query_pairs_mut()
                    .append_pair("error", "access_denied");
            } else {
                redirect
                    .query_pairs_mut()
                    .append_pair("code", "abc123")
                    .append_pair("state", &params["state"]);
            }
            tokio::spawn(async move {
                let _ = reqwest::get(redirect).await;
            });
        }
    }

    // ── Fixtures ────────────────────────────────────────────────────────────

    fn app() -> AppRegistration {
        AppRegistration {
            client_id: "client-1".into(),
            client_secret: SecretString::new("secret-1".into()),
            redirect_uri: "http://127.0.0.1:0/callback".into(),
            credentials_cache_path: PathBuf::from("cache/credentials.json"),
        }
    }

    fn endpoints() -> AuthorizationEndpoints {
        AuthorizationEndpoints {
            base_uri: "https://example.backlog.com".into(),
            auth_resource: "/OAuth2AccessRequest.action".into(),
            token_resource: "/api/v2/oauth2/token".into(),
        }
    }

    fn cached(expires_in: i64) -> Credentials {
        Credentials::from_lifetime(
            "cached".into(),
            Some("cached-refresh".into()),
            expires_in,
            Utc::now(),
        )
        .unwrap()
    }

    struct Harness {
        store: Arc<MemoryStore>,
        exchange: Arc<FakeExchange>,
        browser: Arc<FakeBrowser>,
        broker: AuthorizationBroker,
    }

    fn harness(store: MemoryStore, exchange: FakeExchange, browser: FakeBrowser) -> Harness {
        let store = Arc::new(store);
        let exchange = Arc::new(exchange);
        let browser = Arc::new(browser);
        let broker = AuthorizationBroker::new(store.clone(), exchange.clone(), browser.clone())
            .with_options(BrokerOptions {
                callback_timeout: Duration::from_secs(10),
                ..BrokerOptions::default()
            });
        Harness {
            store,
            exchange,
            browser,
            broker,
        }
    }

    impl Harness {
        fn counts(&self) -> (usize, usize, usize) {
            (
                self.exchange.refresh_calls.load(Ordering::SeqCst),
                self.exchange.code_calls.load(Ordering::SeqCst),
                self.browser.opens.load(Ordering::SeqCst),
            )
        }
    }

    // ── State machine ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_valid_cache_makes_no_calls() {
        let app = app();
        let creds = cached(3600);
        let h = harness(
            MemoryStore::with(&app.credentials_cache_path, creds.clone()),
            FakeExchange::default(),
            FakeBrowser::default(),
        );

        let got = h.broker.get_valid_credentials(&app, &endpoints()).await.unwrap();
        assert_eq!(got, creds);
        assert_eq!(h.counts(), (0, 0, 0));
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_cache_refreshes_once_and_persists() {
        let app = app();
        let h = harness(
            MemoryStore::with(&app.credentials_cache_path, cached(-60)),
            FakeExchange::default(),
            FakeBrowser::default(),
        );

        let got = h.broker.get_valid_credentials(&app, &endpoints()).await.unwrap();
        assert_eq!(got.access_token, "from-refresh-1");
        assert_eq!(h.store.get(&app.credentials_cache_path), Some(got));
        assert_eq!(h.counts(), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_absent_cache_runs_interactive_flow() {
        let app = app();
        let h = harness(
            MemoryStore::default(),
            FakeExchange::default(),
            FakeBrowser::default(),
        );

        let got = h.broker.get_valid_credentials(&app, &endpoints()).await.unwrap();
        assert_eq!(got.access_token, "from-code-1");
        assert_eq!(
            h.exchange.last_code.lock().unwrap().as_deref(),
            Some("abc123")
        );
        assert_eq!(h.store.get(&app.credentials_cache_path), Some(got));
        assert_eq!(h.counts(), (0, 1, 1));
    }

    #[tokio::test]
    async fn test_incomplete_cache_runs_interactive_flow() {
        let app = app();
        let mut partial = cached(3600);
        partial.access_token.clear();
        let h = harness(
            MemoryStore::with(&app.credentials_cache_path, partial),
            FakeExchange::default(),
            FakeBrowser::default(),
        );

        h.broker.get_valid_credentials(&app, &endpoints()).await.unwrap();
        assert_eq!(h.counts(), (0, 1, 1));
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_reauthorizes() {
        let app = app();
        let mut stale = cached(-60);
        stale.refresh_token = None;
        let h = harness(
            MemoryStore::with(&app.credentials_cache_path, stale),
            FakeExchange::default(),
            FakeBrowser::default(),
        );

        h.broker.get_valid_credentials(&app, &endpoints()).await.unwrap();
        assert_eq!(h.counts(), (0, 1, 1));
    }

    #[tokio::test]
    async fn test_cache_without_refresh_token_runs_interactive_flow() {
        let app = app();
        let mut partial = cached(3600);
        partial.refresh_token = None;
        let h = harness(
            MemoryStore::with(&app.credentials_cache_path, partial),
            FakeExchange::default(),
            FakeBrowser::default(),
        );

        let got = h.broker.get_valid_credentials(&app, &endpoints()).await.unwrap();
        assert_eq!(got.access_token, "from-code-1");
        assert_eq!(h.counts(), (0, 1, 1));
    }

    #[tokio::test]
    async fn test_already_expired_issue_is_not_persisted() {
        let app = app();
        let h = harness(
            MemoryStore::with(&app.credentials_cache_path, cached(-60)),
            FakeExchange {
                issued_lifetime: Some(-5),
                ..FakeExchange::default()
            },
            FakeBrowser::default(),
        );

        let err = h.broker.get_valid_credentials(&app, &endpoints()).await.unwrap_err();
        assert!(matches!(err, OAuthError::InvalidTokenResponse(_)));
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_refresh_falls_back_to_consent() {
        let app = app();
        let h = harness(
            MemoryStore::with(&app.credentials_cache_path, cached(-60)),
            FakeExchange {
                refresh_error_status: Some(400),
                ..FakeExchange::default()
            },
            FakeBrowser::default(),
        );

        let got = h.broker.get_valid_credentials(&app, &endpoints()).await.unwrap();
        assert_eq!(got.access_token, "from-code-1");
        assert_eq!(h.counts(), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_rejected_refresh_without_fallback_propagates() {
        let app = app();
        let h = harness(
            MemoryStore::with(&app.credentials_cache_path, cached(-60)),
            FakeExchange {
                refresh_error_status: Some(401),
                ..FakeExchange::default()
            },
            FakeBrowser::default(),
        );
        let broker = h.broker.with_options(BrokerOptions {
            interactive_fallback: false,
            ..BrokerOptions::default()
        });

        let err = broker.get_valid_credentials(&app, &endpoints()).await.unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(h.browser.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_refresh_failure_is_surfaced() {
        let app = app();
        let h = harness(
            MemoryStore::with(&app.credentials_cache_path, cached(-60)),
            FakeExchange {
                refresh_error_status: Some(503),
                ..FakeExchange::default()
            },
            FakeBrowser::default(),
        );

        let err = h.broker.get_valid_credentials(&app, &endpoints()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.counts(), (1, 0, 0));
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_denied_consent_is_declined() {
        let app = app();
        let h = harness(
            MemoryStore::default(),
            FakeExchange::default(),
            FakeBrowser {
                deny: true,
                ..FakeBrowser::default()
            },
        );

        let err = h.broker.get_valid_credentials(&app, &endpoints()).await.unwrap_err();
        assert!(matches!(err, OAuthError::Declined { .. }));
        assert_eq!(h.counts(), (0, 0, 1));
        assert!(h.store.get(&app.credentials_cache_path).is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_consent() {
        let app = app();
        let h = harness(
            MemoryStore::default(),
            FakeExchange::default(),
            FakeBrowser {
                idle: true,
                ..FakeBrowser::default()
            },
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = h
            .broker
            .get_valid_credentials_with_cancel(&app, &endpoints(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::Cancelled));
        assert_eq!(h.counts(), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_save_failure_keeps_fresh_credentials() {
        let app = app();
        let h = harness(
            MemoryStore {
                fail_saves: true,
                ..MemoryStore::with(&app.credentials_cache_path, cached(-60))
            },
            FakeExchange::default(),
            FakeBrowser::default(),
        );

        let err = h.broker.get_valid_credentials(&app, &endpoints()).await.unwrap_err();
        assert!(matches!(err, OAuthError::Persist { .. }));
        let fresh = err.into_credentials().unwrap();
        assert_eq!(fresh.access_token, "from-refresh-1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_expired_calls_refresh_once() {
        let app = app();
        let h = harness(
            MemoryStore::with(&app.credentials_cache_path, cached(-60)),
            FakeExchange {
                refresh_delay: Duration::from_millis(50),
                ..FakeExchange::default()
            },
            FakeBrowser::default(),
        );
        let endpoints = endpoints();

        let (a, b) = tokio::join!(
            h.broker.get_valid_credentials(&app, &endpoints),
            h.broker.get_valid_credentials(&app, &endpoints),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a, b);
        assert_eq!(h.counts(), (1, 0, 0));
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_credentials() {
        let app = app();
        let h = harness(
            MemoryStore::default(),
            FakeExchange::default(),
            FakeBrowser::default(),
        );

        let valid = cached(3600);
        assert_eq!(
            h.broker.update_credentials(&valid, &app, &endpoints()).await.unwrap(),
            valid
        );
        assert_eq!(h.counts(), (0, 0, 0));

        let refreshed = h
            .broker
            .update_credentials(&cached(-1), &app, &endpoints())
            .await
            .unwrap();
        assert_eq!(refreshed.access_token, "from-refresh-1");
        assert_eq!(h.store.get(&app.credentials_cache_path), Some(refreshed));
        assert_eq!(h.counts(), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_access_token_and_clear() {
        let app = app();
        let h = harness(
            MemoryStore::with(&app.credentials_cache_path, cached(3600)),
            FakeExchange::default(),
            FakeBrowser::default(),
        );

        assert_eq!(h.broker.access_token(&app, &endpoints()).await.unwrap(), "cached");
        assert!(h.broker.cached(&app).await.is_some());
        h.broker.clear(&app).await.unwrap();
        assert!(h.broker.cached(&app).await.is_none());
    }

    #[tokio::test]
    async fn test_cached_does_not_wait_for_path_lock() {
        let app = app();
        let h = harness(
            MemoryStore::with(&app.credentials_cache_path, cached(3600)),
            FakeExchange::default(),
            FakeBrowser::default(),
        );
        let lock = h.broker.lock_for(&app.credentials_cache_path);
        let _held = lock.lock().await;

        let got = tokio::time::timeout(Duration::from_secs(1), h.broker.cached(&app))
            .await
            .unwrap();
        assert!(got.is_some());
    }

    #[test]
    fn test_authorization_url() {
        let redirect = Url::parse("http://127.0.0.1:5000/callback").unwrap();
        let url = authorization_url(&app(), &endpoints(), &redirect, "st").unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.backlog.com/OAuth2AccessRequest.action?response_type=code&client_id=client-1&redirect_uri=http%3A%2F%2F127.0.0.1%3A5000%2Fcallback&state=st"
        );
    }

    #[test]
    fn test_random_state_is_urlsafe() {
        let a = random_state();
        assert_eq!(a.len(), 22);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(a, random_state());
    }
}
