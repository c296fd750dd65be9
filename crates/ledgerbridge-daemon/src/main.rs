use clap::Parser;
use ledgerbridge_daemon::config::{self, Cli, Config};
use ledgerbridge_daemon::gate::HttpGateRepository;
use ledgerbridge_daemon::handler::Gateway;
use ledgerbridge_daemon::pipeline::SigningPipeline;
use ledgerbridge_daemon::server;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let directive = cli.log_level.as_deref().unwrap_or("ledgerbridge=info");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let config = Config::resolve(&cli)?;
    let device = config::build_device(&config, None)?;
    device.run()?;
    tracing::info!(state = %device.state(), "device session started");

    let gate = Arc::new(HttpGateRepository::new(
        &config.gate.url,
        Duration::from_secs(config.gate.timeout_secs),
    ));
    let pipeline = Arc::new(SigningPipeline::new(device.clone(), gate));
    let gateway = Arc::new(Gateway::new(pipeline, config.request_timeout()));

    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    server::serve(listener, gateway, shutdown_signal()).await?;

    tracing::info!("shutting down");
    device.stop();
    tokio::task::spawn_blocking(move || device.join()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
