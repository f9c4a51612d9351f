use anyhow::Result;
use untactorder_pki::config;
use untactorder_pki::mode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let init = args.first().is_some_and(|a| a == "init");
    if init {
        args.remove(0);
    }
    let path = args.first().map(String::as_str).unwrap_or("config/certserver.toml");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::AuthorityConfig::load(path)?;
    if init {
        return mode::certserver::init(&cfg);
    }

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

    mode::certserver::run(cfg).await
}
