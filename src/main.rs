//! Civic Intake Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (data under the platform data dir, port 8000)
//! civic-intake
//!
//! # Start with custom config
//! civic-intake --config /path/to/config.toml
//!
//! # Custom storage directory and port
//! civic-intake --storage-dir /srv/civic --http-port 8080
//!
//! # Create the first admin account on startup
//! CIVIC_ADMIN_PASSWORD=... civic-intake --bootstrap-admin admin
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use civic_intake::services::spawn_logging_listener;
use civic_intake::{AttachmentStore, Config, HttpServer, Services, Store};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "civic-intake")]
#[command(about = "Civic report and message intake backend")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "CIVIC_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "CIVIC_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Host to bind the HTTP API to
    #[arg(long, env = "CIVIC_HTTP_HOST")]
    http_host: Option<String>,

    /// HTTP API port
    #[arg(long, env = "CIVIC_HTTP_PORT")]
    http_port: Option<u16>,

    /// HS256 secret for session tokens
    #[arg(long, env = "CIVIC_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "CIVIC_LOG_JSON")]
    log_json: bool,

    /// Ensure an admin account with this username exists
    #[arg(long)]
    bootstrap_admin: Option<String>,

    /// Password for --bootstrap-admin
    #[arg(long, env = "CIVIC_ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("civic_intake=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("reading config {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(host) = args.http_host {
        config.http_host = host;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if args.jwt_secret.is_some() {
        config.jwt_secret = args.jwt_secret;
    }

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        "Starting civic-intake"
    );

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        // The secret is never written out
        let mut on_disk = config.clone();
        on_disk.jwt_secret = None;
        on_disk.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let config = Arc::new(config);
    let store = Arc::new(Store::open(&config).context("opening database")?);
    let services = Arc::new(Services::new(store, config.clone())?);

    if let Some(username) = &args.bootstrap_admin {
        let password = args
            .admin_password
            .as_deref()
            .context("--bootstrap-admin needs CIVIC_ADMIN_PASSWORD")?;
        let admin = services.users.bootstrap_admin(username, password)?;
        info!(admin = %admin.principal.id, username = %username, "Admin account ready");
    }

    let _audit = spawn_logging_listener(services.events.clone());

    let attachments = Arc::new(AttachmentStore::new(config.attachments_dir(), config.max_attachment_bytes).await?);

    let http_addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.http_host, config.http_port))?;
    let server = Arc::new(HttpServer::new(services, attachments, http_addr));
    info!("HTTP API available at http://{}", http_addr);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
