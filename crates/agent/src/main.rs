use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relay_agent::{
    client::{HttpRelayClient, USER_AGENT},
    config::AgentConfig,
    executor::SshExecutor,
    runtime::Runtime,
};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "relay-agent", version, about = "Runs relay tasks inside a customer network")]
struct Args {
    /// Daemon base URL, e.g. https://relay.example.com
    #[arg(long, env = "RELAY_SERVER_URL")]
    server_url: String,

    /// Agent bearer token issued at provisioning.
    #[arg(long, env = "RELAY_AGENT_TOKEN", hide_env_values = true)]
    token: String,

    /// Seconds between polls.
    #[arg(long, default_value_t = 5)]
    poll_interval_secs: u64,

    /// Connect and I/O timeout for SSH sessions.
    #[arg(long, default_value_t = 30)]
    ssh_timeout_secs: u64,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig {
        server_url: args.server_url,
        token: args.token,
        poll_interval: Duration::from_secs(args.poll_interval_secs.max(1)),
        ssh_timeout: Duration::from_secs(args.ssh_timeout_secs.max(1)),
        request_timeout: Duration::from_secs(30),
    };
    info!(?config, user_agent = USER_AGENT, "agent starting");

    let client = HttpRelayClient::new(&config.server_url, config.token.clone(), config.request_timeout)?;
    let runtime = Runtime::new(Arc::new(client), Arc::new(SshExecutor::new(config.ssh_timeout)));

    runtime.startup().await?;
    runtime.run(config.poll_interval, shutdown_signal()).await;

    info!("agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown requested");
}
