// presenced: presence aggregation daemon.

use anyhow::Context;
use presence_aggregator::config::AggregatorConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AggregatorConfig::from_env();

    // RUST_LOG wins over the configured filter when set.
    let filter = config.as_ref().map_or("info", |config| config.log_filter.as_str());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = config.context("invalid aggregator configuration")?;
    info!(
        app_id = config.api_key.app_id(),
        rest = %config.rest_base_url,
        initial_fetch = config.fetch_initial_state,
        "starting presence aggregator"
    );

    presence_aggregator::runtime::run(config)
        .await
        .context("presence aggregator terminated unexpectedly")
}
