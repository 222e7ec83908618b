use anyhow::Context;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("portal_gateway=info")))
        .init();

    let config = portal_gateway::config::Config::from_env().context("loading gateway configuration")?;
    portal_gateway::run(config).await
}
