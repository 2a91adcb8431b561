mod auth_commands;
mod config;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "backlog", about = "Backlog ticket tracker client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to backlog.toml (defaults to the platform config directory).
    #[arg(long, global = true, env = "BACKLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Space URL, e.g. https://example.backlog.com.
    #[arg(long, global = true, env = "BACKLOG_SPACE_URL")]
    space_url: Option<String>,

    /// OAuth2 client id of the registered application.
    #[arg(long, global = true, env = "BACKLOG_CLIENT_ID")]
    client_id: Option<String>,

    /// OAuth2 client secret of the registered application.
    #[arg(long, global = true, env = "BACKLOG_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Where the credential cache is kept.
    #[arg(long, global = true, env = "BACKLOG_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Authentication management.
    Auth {
        #[command(subcommand)]
        action: auth_commands::AuthAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "backlog starting");

    let overrides = config::Overrides {
        space_url: cli.space_url,
        client_id: cli.client_id,
        client_secret: cli.client_secret,
        credentials_cache_path: cli.credentials,
    };
    let settings = config::BacklogConfig::load(cli.config.as_deref())?.resolve(overrides)?;

    match cli.command {
        Commands::Auth { action } => auth_commands::handle_auth(action, settings).await,
    }
}
