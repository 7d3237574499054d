use rail_reservation_worker::{logging, Config, ProviderRegistry, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (.env first, then the process environment)
    let config = Config::from_env()?;

    // Initialize logging
    logging::init(&config.log_filter, config.log_format);

    // Booking-site connectors are registered here
    let registry = ProviderRegistry::new();

    let worker = Worker::start(config, registry).await?;
    tracing::info!(addr = %worker.local_addr(), "Control API listening");

    worker.run_until_ctrl_c().await
}
