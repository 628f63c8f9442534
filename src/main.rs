use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use synguard::config::Config;
use synguard::conn_table::StateTable;
use synguard::monitor;
use synguard::pipeline::Pipeline;
use synguard::stats::PipelineStats;

/// Stateful TCP firewall on NFQUEUE
#[derive(Parser, Debug)]
#[command(name = "synguard")]
#[command(version = "0.1.0")]
#[command(about = "User-space stateful TCP firewall with SYN/RST flood mitigation", long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Netfilter queue number to bind
    #[arg(long)]
    queue_num: Option<u16>,

    /// Monitor bind address (host:port)
    #[arg(long)]
    monitor_addr: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("Starting synguard v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Override with command line arguments
    if let Some(queue_num) = args.queue_num {
        config.queue.queue_num = queue_num;
    }
    if let Some(monitor_addr) = args.monitor_addr {
        config.monitor.bind_addr = monitor_addr;
    }

    config.validate()?;

    let table = Arc::new(StateTable::new(
        config.table.clone(),
        config.flood.clone(),
    ));
    let stats = Arc::new(PipelineStats::new());
    let pipeline = Arc::new(Pipeline::new(table.clone(), stats.clone()));

    // Background expiry sweep
    let _sweeper = table.clone().spawn_sweeper();

    // Monitoring surface
    let monitor_addr: SocketAddr = config.monitor.bind_addr.parse()?;
    let monitor_table = table.clone();
    let monitor_stats = stats.clone();
    tokio::spawn(async move {
        if let Err(e) = monitor::serve(monitor_addr, monitor_table, monitor_stats).await {
            tracing::error!("monitor server error: {}", e);
        }
    });

    run_queue(config, pipeline).await
}

#[cfg(target_os = "linux")]
async fn run_queue(config: Config, pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    use synguard::nfqueue::QueueRunner;

    let runner = QueueRunner::new(config.queue.clone(), pipeline);
    tokio::task::spawn_blocking(move || runner.run()).await?
}

#[cfg(not(target_os = "linux"))]
async fn run_queue(_config: Config, _pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    anyhow::bail!("the NFQUEUE transport requires Linux")
}
