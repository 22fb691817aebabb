use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use formbuilder_server::routes::{build_router, AppState, UrlConf};
use formbuilder_server::settings::Settings;
use formbuilder_server::views::FormViewRegistry;
use formbuilder_server::{build_context, default_registry, load_trees};

// Global constants for local development server
const LOCAL_SERVER_HOST: &str = "127.0.0.1:8000";
const LOG_ENV: &str = "FORMBUILDER_LOG";

#[derive(Parser, Debug)]
#[command(name = "formbuilder-server", version, about = "Form builder ajax endpoint")]
struct ServerCli {
    /// Server host and port
    #[arg(long, default_value = LOCAL_SERVER_HOST)]
    bind: String,
    /// Verbose logs
    #[arg(short, long)]
    verbose: bool,
    /// JSON file with the plugin trees to serve
    #[arg(long)]
    trees: Option<PathBuf>,
    /// SQLite database for form entries
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ServerCli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var(LOG_ENV).unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings = Settings::from_env()?;
    if let Some(trees) = cli.trees {
        settings.trees_path = Some(trees);
    }
    if let Some(database) = cli.database {
        settings.database_path = database;
    }

    start_server(&cli.bind, settings).await
}

async fn start_server(bind_addr: &str, settings: Settings) -> Result<()> {
    // Configuration errors end start-up here, before any traffic is served.
    let registry = default_registry().context("registering built-in actions")?;
    let tree = load_trees(&settings).context("loading plugin trees")?;
    let user_header = settings.user_header.clone();
    let prefix = settings.url_prefix.clone();
    let ajax = build_context(settings, tree, registry, FormViewRegistry::new())?;

    let mut urlconf = UrlConf::new();
    urlconf.install_form_builder_urls(&prefix);
    let app = build_router(AppState { ajax, user_header }, &urlconf);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    info!("Server listening on http://{}{}", bind_addr, prefix);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}
