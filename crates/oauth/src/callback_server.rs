//! Single-use loopback listener that captures the authorization code.
//!
//! The server binds on a background task and reports back through a oneshot
//! once the socket is listening, so the browser is never pointed at a port
//! nobody is accepting on. The first request to the redirect path settles the
//! outcome; the socket is closed on every exit path, including when the
//! [`PendingCallback`] is dropped mid-wait.

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use {
    axum::{
        Router,
        extract::State,
        http::{StatusCode, Uri, header},
        response::{Html, IntoResponse, Response},
    },
    tokio::{
        net::TcpListener,
        sync::{Mutex, oneshot},
        task::JoinHandle,
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    url::{Host, Url},
};

use crate::error::OAuthError;

/// Upper bound on waiting for the server task to wind down after a result.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Authorized</title></head>\
<body><h1>Authorization complete</h1><p>You can close this window and return to the application.</p></body></html>";

const FAILURE_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Authorization failed</title></head>\
<body><h1>Authorization failed</h1><p>Return to the application for details.</p></body></html>";

const DONE_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Already completed</title></head>\
<body><h1>This authorization request has already been handled</h1></body></html>";

type Outcome = Result<String, OAuthError>;

#[derive(Clone)]
struct CallbackState {
    path: Arc<str>,
    expected_state: Option<Arc<str>>,
    slot: Arc<Mutex<Option<oneshot::Sender<Outcome>>>>,
}

pub struct CallbackServer;

impl CallbackServer {
    /// Bind the listener for `redirect_uri` and return once it is accepting.
    ///
    /// `expected_state`, when set, must match the `state` query parameter of
    /// the redirect. `timeout` counts from the moment the listener is ready.
    pub async fn start(
        redirect_uri: &str,
        expected_state: Option<String>,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<PendingCallback, OAuthError> {
        let (mut uri, addr) = parse_loopback(redirect_uri)?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        let shutdown = CancellationToken::new();

        let state = CallbackState {
            path: Arc::from(normalize_path(uri.path())),
            expected_state: expected_state.map(Arc::from),
            slot: Arc::new(Mutex::new(Some(result_tx))),
        };
        let server = tokio::spawn(serve(addr, state, ready_tx, shutdown.clone()));

        let local = match ready_rx.await {
            Ok(Ok(local)) => local,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(OAuthError::Io(io::Error::other(
                    "redirect listener exited before binding",
                )));
            },
        };
        uri.set_port(Some(local.port()))
            .map_err(|()| OAuthError::InvalidRedirectUri(redirect_uri.to_string()))?;

        info!(addr = %local, "redirect listener ready");
        Ok(PendingCallback {
            redirect_uri: uri,
            local_addr: local,
            result_rx,
            cancel,
            deadline: Instant::now() + timeout,
            shutdown,
            server: Some(server),
        })
    }

    /// Bind, wait for exactly one redirect, and shut down.
    pub async fn await_code(
        redirect_uri: &str,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<String, OAuthError> {
        Self::start(redirect_uri, None, cancel, timeout)
            .await?
            .wait()
            .await
    }
}

/// A bound listener waiting for the browser redirect.
pub struct PendingCallback {
    redirect_uri: Url,
    local_addr: SocketAddr,
    result_rx: oneshot::Receiver<Outcome>,
    cancel: CancellationToken,
    deadline: Instant,
    shutdown: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl PendingCallback {
    /// Redirect URI with the port actually bound.
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the redirect, cancellation, or the deadline, whichever comes
    /// first. The listening socket is closed before this returns.
    pub async fn wait(mut self) -> Result<String, OAuthError> {
        let outcome = tokio::select! {
            biased;
            r = &mut self.result_rx => r.unwrap_or_else(|_| {
                Err(OAuthError::Io(io::Error::other("redirect listener stopped unexpectedly")))
            }),
            () = self.cancel.cancelled() => Err(OAuthError::Cancelled),
            () = tokio::time::sleep_until(self.deadline) => Err(OAuthError::TimedOut),
        };
        self.close().await;

        match &outcome {
            Ok(_) => debug!("authorization code captured"),
            Err(e) => warn!(error = %e, "authorization redirect not completed"),
        }
        outcome
    }

    async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(mut server) = self.server.take()
            && tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err()
        {
            server.abort();
            let _ = server.await;
        }
        debug!(addr = %self.local_addr, "redirect listener closed");
    }
}

impl Drop for PendingCallback {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

async fn serve(
    addr: SocketAddr,
    state: CallbackState,
    ready: oneshot::Sender<Result<SocketAddr, OAuthError>>,
    shutdown: CancellationToken,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(source) => {
            let _ = ready.send(Err(OAuthError::Bind { addr, source }));
            return;
        },
    };
    let local = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => {
            let _ = ready.send(Err(OAuthError::Io(e)));
            return;
        },
    };
    if ready.send(Ok(local)).is_err() {
        return;
    }

    let app = Router::new().fallback(handle_redirect).with_state(state);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        warn!(error = %e, "redirect listener failed");
    }
}

async fn handle_redirect(State(state): State<CallbackState>, uri: Uri) -> Response {
    if normalize_path(uri.path()) != &*state.path {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Some(tx) = state.slot.lock().await.take() else {
        return (
            StatusCode::OK,
            [(header::CONNECTION, "close")],
            Html(DONE_PAGE),
        )
            .into_response();
    };

    let query = uri.query().unwrap_or_default();
    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    let outcome = parse_redirect(&params, state.expected_state.as_deref());
    let page = if outcome.is_ok() {
        SUCCESS_PAGE
    } else {
        FAILURE_PAGE
    };
    let _ = tx.send(outcome);

    (StatusCode::OK, [(header::CONNECTION, "close")], Html(page)).into_response()
}

fn parse_redirect(
    params: &HashMap<String, String>,
    expected_state: Option<&str>,
) -> Result<String, OAuthError> {
    if let Some(code) = params.get("code").filter(|c| !c.is_empty()) {
        if let Some(expected) = expected_state
            && params.get("state").map(String::as_str) != Some(expected)
        {
            return Err(OAuthError::StateMismatch);
        }
        return Ok(code.clone());
    }
    if let Some(error) = params.get("error") {
        return Err(OAuthError::Declined {
            error: error.clone(),
            description: params.get("error_description").cloned(),
        });
    }
    Err(OAuthError::MalformedRedirect(
        "redirect carried neither code nor error".into(),
    ))
}

/// Resolve the redirect URI to a loopback socket address.
fn parse_loopback(redirect_uri: &str) -> Result<(Url, SocketAddr), OAuthError> {
    let invalid = |why: &str| OAuthError::InvalidRedirectUri(format!("{redirect_uri}: {why}"));

    let uri = Url::parse(redirect_uri).map_err(|e| invalid(&e.to_string()))?;
    if uri.scheme() != "http" {
        return Err(invalid("scheme must be http"));
    }
    let ip: IpAddr = match uri.host() {
        Some(Host::Ipv4(ip)) if ip.is_loopback() => ip.into(),
        Some(Host::Ipv6(ip)) if ip.is_loopback() => ip.into(),
        Some(Host::Domain(d)) if d.eq_ignore_ascii_case("localhost") => {
            Ipv4Addr::LOCALHOST.into()
        },
        _ => return Err(invalid("host must be a loopback address")),
    };
    let port = uri.port_or_known_default().unwrap_or(80);
    Ok((uri, SocketAddr::new(ip, port)))
}

fn normalize_path(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        p => p,
    }
}
