#![warn(missing_docs)]

//! `dsrepl`: drive the replication topology of a 389 Directory Server instance.

use anyhow::Result;
use clap::Parser;
use dsrepl_topology::cli::Cli;
use dsrepl_topology::{
    ControllerConfig, DsconfGateway, EventBus, ReplicationController, TopologyEvent,
    TopologyObserver, TracingObserver,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    let mut config = if cli.config.exists() {
        ControllerConfig::from_file(&cli.config)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
        ControllerConfig::default()
    };
    if let Some(instance) = &cli.instance {
        config.instance = instance.clone();
    }
    config.validate()?;

    let gateway = Arc::new(DsconfGateway::new(
        config.dsconf_path.clone(),
        config.instance_url(),
    ));
    let bus = EventBus::new(config.event_capacity);
    let mut events = bus.subscribe();
    let observer: Arc<dyn TopologyObserver> = Arc::new(bus);
    let controller = ReplicationController::new(gateway, observer, &config);

    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TopologyEvent::StateChanged { kind, snapshot }) => {
                    TracingObserver.on_state_changed(kind, &snapshot)
                }
                Ok(TopologyEvent::Error { operation, message }) => {
                    TracingObserver.on_error(&operation, &message)
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event log lagging")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tracing::debug!(instance = %config.instance_url(), "dsrepl starting");
    let result = cli.run(&controller).await;
    controller.shutdown();
    logger.abort();
    result
}
