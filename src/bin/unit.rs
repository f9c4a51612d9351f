use anyhow::Result;
use untactorder_pki::config;
use untactorder_pki::mode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "config/unit.toml".into());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::UnitConfig::load(&path)?;
    mode::unit::run(cfg).await
}
