use std::path::PathBuf;

use caskstore_controlplane::{config::ControlPlaneConfig, metrics, service::Service};
use clap::Parser;
use tracing_subscriber::{Layer, Registry, layer::SubscriberExt};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

/// Install the global tracing subscriber: compact console output locally,
/// flattened JSON everywhere else, level taken from RUST_LOG.
fn setup_tracing(config: &ControlPlaneConfig) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    });

    let log_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.structured_logging() {
        Box::new(
            json_subscriber::fmt::layer()
                .with_span_list(false)
                .flatten_event(true)
                .flatten_current_span_on_top_level(true),
        )
    } else {
        Box::new(tracing_subscriber::fmt::layer().compact())
    };

    let subscriber = Registry::default().with(log_layer.with_filter(env_filter));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = if let Some(path) = cli.config {
        ControlPlaneConfig::from_path(path.to_str().unwrap())?
    } else {
        ControlPlaneConfig::default()
    };

    setup_tracing(&config)?;
    metrics::init_provider(&config.telemetry, &config.node_id)?;

    Service::new(config).run().await
}
