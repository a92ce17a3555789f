use clap::Parser;
use fluxgate::api::{build_router, ApiState};
use fluxgate::config::ProxyConfig;
use fluxgate::proxy::Proxy;
use fluxgate::transfer::Transfer;
use fluxgate::telemetry;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "fluxgate")]
#[command(about = "A sharding proxy for InfluxDB-compatible time-series backends")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "fluxgate.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    telemetry::init_tracing();

    let cfg = ProxyConfig::load(&cli.config)
        .map_err(|e| format!("failed to load config from {:?}: {}", cli.config, e))?;
    cfg.print_summary();

    let proxy = Proxy::new(&cfg)?;
    proxy.start_workers();
    let transfer = Transfer::new(&cfg, proxy.clone())?;
    let state = ApiState::new(&cfg, proxy.clone(), transfer);
    let router = build_router(state);

    let addr = listen_addr(&cfg.listen_addr);
    info!("fluxgate v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    proxy.close();
    info!("fluxgate stopped");
    Ok(())
}

/// `":7076"` style addresses bind all interfaces
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
