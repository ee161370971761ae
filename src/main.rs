//! splitdns - a policy-routed DNS forwarder

pub mod config;
pub mod dns_server;
pub mod forwarder;
pub mod geosite;
pub mod message;
pub mod rules;
pub mod upstream;

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Local-time formatter; the default writes UTC timestamps.
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "splitdns")]
#[command(about = "Policy-routed DNS forwarder", long_about = None)]
struct Args {
    /// Configuration file, resolved next to the executable if not found
    /// in the working directory.
    #[arg(short, long, default_value = "appsettings.json")]
    config: String,

    /// Geosite database, resolved the same way.
    #[arg(long, default_value = "geosite.dat")]
    geosite: String,

    /// UDP/TCP DNS listener.
    #[arg(long, default_value = "0.0.0.0:5383")]
    listen: String,

    /// DoH (HTTP) listener.
    #[arg(long, default_value = "0.0.0.0:8125")]
    http_listen: String,
}

fn main() -> Result<()> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("splitdns-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cores))
}

async fn async_main(cores: usize) -> Result<()> {
    std::fs::create_dir_all("logs").unwrap_or_default();

    let file_appender = RollingFileAppender::new(
        "logs/splitdns.log",
        RollingConditionBasic::new().daily(),
        30,
    )?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).with_timer(LocalTimer))
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    let args = Args::parse();
    info!("Starting splitdns version {}", env!("CARGO_PKG_VERSION"));
    info!(">>> Runtime sized to {} worker threads", cores);

    let dns_addr: SocketAddr = args.listen.parse()?;
    let http_addr: SocketAddr = args.http_listen.parse()?;
    let config_path = config::resolve_data_path(&args.config);
    let geosite_path = config::resolve_data_path(&args.geosite);
    info!(">>> Configuration: {}", config_path.display());
    info!(">>> Geosite database: {}", geosite_path.display());

    let forwarder =
        Arc::new(forwarder::Forwarder::from_files(&config_path, &geosite_path).await?);
    let server = dns_server::DnsServer::new(forwarder, dns_addr, http_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await
}
