use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use veriface_core::PopulationStore;
use veriface_source::FileOpener;
use verifaced::config::BusKind;
use verifaced::dbus_interface::{VerifierService, BUS_NAME, OBJECT_PATH};
use verifaced::{Config, EngineHandle, IdentityStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "verifaced starting");

    let config = Config::from_env().context("invalid configuration")?;

    // Fail fast if the observation model is not running.
    let opener = FileOpener::probe(&config.source_path, config.source_options())
        .context("observation source unavailable")?;

    let store = IdentityStore::new(&config.store_path);
    let identities = store.load().context("failed to load identity store")?;
    let engine = EngineHandle::new(
        Arc::new(opener),
        PopulationStore::new(identities),
        Some(store),
        config.engine_settings(),
    );

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, VerifierService::new(engine))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "verifaced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("verifaced shutting down");

    Ok(())
}
