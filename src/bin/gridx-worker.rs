use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gridx::config::WorkerConfig;
use gridx::shutdown::install_shutdown_handler;
use gridx::worker::WorkerClient;

#[derive(Parser, Debug)]
#[command(name = "gridx-worker")]
#[command(about = "Grid-X worker: runs dispatched jobs in sandboxed containers for credits")]
struct Args {
    /// Account that owns this worker and collects its rewards
    #[arg(long)]
    user: String,

    /// Shared secret for the account (installed on first contact)
    #[arg(long)]
    password: String,

    /// Coordinator host
    #[arg(long, default_value = "127.0.0.1")]
    coordinator_ip: String,

    /// Coordinator request/response API port
    #[arg(long, default_value = "8081")]
    http_port: u16,

    /// Coordinator worker-session port
    #[arg(long, default_value = "8080")]
    stream_port: u16,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let heartbeat_s: u64 = std::env::var("GRIDX_HEARTBEAT_INTERVAL_S")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(15);
    let max_capture_bytes: usize = std::env::var("GRIDX_MAX_CAPTURE_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(64 * 1024);
    let workspace_root = std::env::var("GRIDX_WORKSPACE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("gridx-workspace"));

    let config = WorkerConfig {
        account_id: args.user,
        secret: args.password,
        coordinator_ip: args.coordinator_ip,
        stream_port: args.stream_port,
        heartbeat_interval: Duration::from_secs(heartbeat_s),
        max_capture_bytes,
        workspace_root,
    };

    tracing::info!(
        account_id = %config.account_id,
        coordinator = %config.stream_url(),
        "Starting Grid-X worker"
    );

    let shutdown = install_shutdown_handler();
    let client = WorkerClient::new(config);
    let exit = client.run(shutdown).await;
    tracing::info!(?exit, "Worker stopped");
    std::process::ExitCode::from(exit.code() as u8)
}
