use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relay_daemon::{
    config::DaemonConfig,
    db::Db,
    http::{self, AppState},
    reconciler,
    secrets::CommandSecretStore,
    service::{RelayService, ServiceConfig, Stores},
    store::SurrealStore,
};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "relay-daemon", version, about = "Task relay for on-prem PBX appliances")]
struct Cli {
    /// Where the HTTP API will listen, e.g. 127.0.0.1:8080
    #[arg(long, env = "RELAY_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// SurrealDB endpoint; `surrealkv://<dir>` for the embedded store.
    #[arg(long, env = "RELAY_DB_URL", default_value = "surrealkv://.relay/db")]
    db_url: String,

    /// Claims not touched for this long are recycled.
    #[arg(long, default_value_t = 300)]
    liveness_window_secs: u64,

    /// Background stale-claim sweep interval.
    #[arg(long, default_value_t = 30)]
    reconcile_interval_secs: u64,

    /// Attempts per task unless the task sets its own.
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Program that decrypts a target secret: ciphertext on stdin, plaintext on stdout.
    #[arg(long, env = "RELAY_DECRYPT_COMMAND")]
    decrypt_command: String,

    /// Argument passed to the decrypt command (repeatable).
    #[arg(long = "decrypt-arg", allow_hyphen_values = true)]
    decrypt_args: Vec<String>,

    #[arg(long, default_value_t = 10)]
    decrypt_timeout_secs: u64,

    /// Bearer token for the admin API. Admin routes are disabled without it.
    #[arg(long, env = "RELAY_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// Log filter (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&cli.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DaemonConfig {
        listen: cli.listen,
        db_url: cli.db_url,
        liveness_window: Duration::from_secs(cli.liveness_window_secs),
        reconcile_interval: Duration::from_secs(cli.reconcile_interval_secs.max(1)),
        default_max_attempts: cli.max_attempts.max(1),
        decrypt_command: cli.decrypt_command,
        decrypt_args: cli.decrypt_args,
        decrypt_timeout: Duration::from_secs(cli.decrypt_timeout_secs),
        admin_token: cli.admin_token,
    };

    info!(
        listen = %config.listen,
        db_url = %config.db_url,
        liveness_window = ?config.liveness_window,
        max_attempts = config.default_max_attempts,
        admin_api = config.admin_token.is_some(),
        "starting daemon"
    );

    if let Some(dir) = config.db_url.strip_prefix("surrealkv://") {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {dir}"))?;
    }
    let db = Db::connect(&config.db_url).await?;
    db.apply_schema().await?;

    let store = Arc::new(SurrealStore::new(db));
    let secrets = Arc::new(CommandSecretStore::new(
        config.decrypt_command.clone(),
        config.decrypt_args.clone(),
        config.decrypt_timeout,
    ));
    let svc = Arc::new(RelayService::new(
        Stores::shared(store),
        secrets,
        ServiceConfig {
            liveness_window_ms: config.liveness_window_ms(),
            default_max_attempts: config.default_max_attempts,
        },
    ));

    let reconciler = reconciler::spawn_reconciler(Arc::clone(&svc), config.reconcile_interval);

    let app = http::router(AppState::new(svc, config.admin_token.clone()));

    info!("listening on http://{}", config.listen);
    axum::serve(
        tokio::net::TcpListener::bind(config.listen).await?,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    reconciler.abort();
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown requested");
}
