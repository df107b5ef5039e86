use clap::Parser;
use tracing_subscriber::EnvFilter;

use gridx::config::CoordinatorConfig;
use gridx::coordinator::Coordinator;
use gridx::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "gridx-coordinator")]
#[command(about = "Grid-X coordinator: accepts jobs, schedules them onto workers, settles credits")]
struct Args {
    /// Bind port for the request/response API (overrides GRIDX_HTTP_PORT)
    #[arg(long)]
    http_port: Option<u16>,

    /// Bind port for worker sessions (overrides GRIDX_WS_PORT)
    #[arg(long)]
    stream_port: Option<u16>,

    /// SQLite database path (overrides GRIDX_DB_PATH)
    #[arg(long)]
    db_path: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = CoordinatorConfig::from_env();
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(port) = args.stream_port {
        config.stream_port = port;
    }
    if let Some(path) = args.db_path {
        config.db_path = path;
    }

    tracing::info!(
        http_port = config.http_port,
        stream_port = config.stream_port,
        db_path = %config.db_path.display(),
        "Starting Grid-X coordinator"
    );

    let shutdown = install_shutdown_handler();
    let (coordinator, signal_rx) = Coordinator::new(config).await?;
    coordinator.run(signal_rx, shutdown).await?;
    Ok(())
}
