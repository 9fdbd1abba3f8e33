use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod manager;
mod settings;
mod supervisor;
mod worker;


use settings::Settings;

/// Supervised per-country ingestion and curation of the GeoNames dump.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma separated ISO2 allow-list, overriding the configuration
    #[arg(long)]
    countries: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::new(args.config.as_deref()).context("load settings")?;
    if let Some(countries) = &args.countries {
        settings.countries = Some(
            countries
                .split(',')
                .map(|code| code.trim().to_uppercase())
                .collect(),
        );
    }

    // logging
    let default_filter = if settings.trace { "debug" } else { "info" };
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer());
    subscriber.init();

    tracing::info!(target_dir = %settings.target_dir.display(), "starting");

    let mut handle = supervisor::spawn(Arc::new(settings));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tokio::select! {
        signal = &mut shutdown => {
            signal.context("listen for shutdown signal")?;
            tracing::info!("shutdown signal received");
        }
        result = handle.wait() => {
            result.context("ingestion subsystem gave up")?;
            return Ok(());
        }
    }

    let goodbye = handle.shutdown().await.context("orderly shutdown")?;
    tracing::info!(
        stopped = goodbye.stopped,
        stragglers = goodbye.stragglers,
        "goodbye"
    );
    Ok(())
}
