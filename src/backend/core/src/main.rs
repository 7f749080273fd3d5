//! Stevedore server - main entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stevedore_core::config::Config;
use stevedore_core::runtime::Bootstrap;

#[derive(Parser)]
#[command(name = "stevedore-server", about = "Distributed job execution service")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Missing secret or unparseable config are fatal startup conditions.
    let secret = Config::api_secret()?;
    let config = Config::load(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = %config.redis.namespace,
        "starting stevedore server"
    );

    Bootstrap::new(config, secret).load_and_run().await?;
    Ok(())
}
