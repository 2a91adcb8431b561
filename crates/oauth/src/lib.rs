pub mod broker;
pub mod browser;
pub mod callback_server;
pub mod error;
pub mod flow;
pub mod storage;
pub mod types;

pub use broker::AuthorizationBroker;
pub use browser::{BrowserLauncher, SystemBrowser};
pub use callback_server::{CallbackServer, PendingCallback};
pub use error::OAuthError;
pub use flow::{TokenClient, TokenExchange};
pub use storage::{CredentialStore, FileCredentialStore};
pub use types::{
    AppRegistration, AuthorizationEndpoints, BrokerOptions, CredentialState, Credentials,
};
