use {tracing::warn, url::Url};

/// Opens the consent page for the user.
pub trait BrowserLauncher: Send + Sync {
    /// Fire and forget. Failures are reported to the user, never returned.
    fn open(&self, url: &Url);
}

/// Launches the OS default URI handler. When that fails the URL is logged and
/// printed to stderr so the user can open it by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &Url) {
        if let Err(e) = open::that_detached(url.as_str()) {
            warn!(error = %e, %url, "could not open browser");
            eprintln!("{}", manual_visit_notice(url));
        }
    }
}

fn manual_visit_notice(url: &Url) -> String {
    format!("Could not open browser. Please visit:\n{url}")
}
