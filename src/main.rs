use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use rfgwd::bootstrap::Server;
use rfgwd::config::Config;
use rfgwd::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "rfgwd")]
#[command(author, version, about = "Offline charging gateway bridging IMS events to Diameter Rf")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Session stores as <site>=<domain>[,<site>=<domain>...], overriding
    /// the config file
    #[arg(long, value_name = "SITES")]
    session_stores: Option<String>,

    /// Which site's store is local, overriding the config file
    #[arg(long, value_name = "SITE")]
    local_site_name: Option<String>,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings), applying any
    // command-line store overrides before validation.
    let mut config = Config::load_unvalidated(&args.config)?;
    config.apply_store_overrides(
        args.session_stores.as_deref(),
        args.local_site_name.as_deref(),
    )?;
    config.validate()?;

    let tracing_config = TracingConfig {
        service_name: "rfgwd".to_string(),
        log_level: config.telemetry.log_level.clone(),
        json_logs: config.telemetry.json_logs,
    };

    init_tracing(&tracing_config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting rfgwd"
    );

    info!(
        stores = config.stores.session_stores.len(),
        local_site = %config.stores.local_site_name,
        billing_realm = %config.billing.realm,
        "configuration loaded"
    );

    // Validate only mode
    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    let server = Server::new(config)?;
    server.run().await?;

    Ok(())
}
