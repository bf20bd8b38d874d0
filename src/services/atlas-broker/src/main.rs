//! Atlas Service Broker Server
//!
//! Loads configuration, credentials, templates and the whitelist, builds the
//! service catalog once (startup fails if that is impossible) and serves the
//! broker API.

use anyhow::{Context, Result};
use atlas_broker::{
    atlas::AtlasClient,
    config::{Args, BrokerConfig},
    handlers::{create_router, AppState},
    store::{InstanceStore, MongoInstanceStore},
    Broker,
};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// Telemetry and observability setup
mod telemetry {
    use anyhow::Result;
    use atlas_broker::config::BrokerConfig;
    use atlas_broker_shared::LogFormat;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    /// Initialize tracing and logging
    pub fn init_tracing(config: &BrokerConfig) -> Result<()> {
        let env_filter =
            EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

        let fmt_layer = match config.logging.format {
            LogFormat::Json => fmt::layer().json().boxed(),
            LogFormat::Pretty => fmt::layer().pretty().boxed(),
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();

        Ok(())
    }
}

/// Graceful shutdown handling
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn build_broker(config: &BrokerConfig) -> Result<Broker> {
    let credentials = config
        .load_credentials()
        .context("Failed to load credentials")?;

    let source = AtlasClient::metadata(&config.atlas.base_url, config.atlas.request_timeout())
        .context("Failed to create Atlas metadata client")?;

    let mut broker = Broker::new(
        config.broker.mode,
        Arc::new(credentials),
        config.atlas.base_url.clone(),
        Arc::new(source),
    )
    .with_request_timeout(config.atlas.request_timeout());

    if let Some(templates) = config
        .load_templates()
        .context("Failed to load plan templates")?
    {
        info!(templates = templates.len(), "Plan templates loaded");
        broker = broker.with_templates(Arc::new(templates));
    }

    if let Some(whitelist) = config
        .load_whitelist()
        .context("Failed to load plan whitelist")?
    {
        broker = broker.with_whitelist(whitelist);
    }

    match &config.database.mongo_url {
        Some(url) => {
            let store = MongoInstanceStore::connect(
                url,
                &config.database.database,
                &config.database.collection,
            )
            .await
            .context("Failed to initialize MongoDB instance store")?;
            broker = broker.with_store(Arc::new(store) as Arc<dyn InstanceStore>);
        }
        None => warn!("No MongoDB URL configured, instance metadata will not be persisted"),
    }

    Ok(broker)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = BrokerConfig::load(&args)?;

    telemetry::init_tracing(&config)?;

    info!(
        "Starting Atlas Service Broker v{} in {} mode",
        env!("CARGO_PKG_VERSION"),
        config.broker.mode
    );
    info!("Configuration loaded from: {:?}", args.config);

    let broker = Arc::new(build_broker(&config).await?);

    broker
        .catalog()
        .await
        .context("Cannot build service catalog")?;

    let app = create_router(AppState::new(Arc::clone(&broker)));

    let address = config.server.address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .context("Failed to bind to server address")?;

    info!("Atlas Service Broker listening on {}", address);
    info!("Catalog endpoint: http://{}/v2/catalog", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server failed to start")?;

    info!("Atlas Service Broker shutdown complete");
    Ok(())
}
