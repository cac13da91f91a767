use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use idgate_core::VerificationStateMachine;
use tracing_subscriber::EnvFilter;

mod camera;
mod capture;
mod config;
mod dbus_interface;
#[cfg(test)]
mod fakes;
mod orchestrator;
mod providers;
mod resolver;
mod service;
mod store;
mod uploads;

use camera::ReplayCameraBackend;
use config::{Config, DOCUMENT_URL_TTL};
use dbus_interface::{AppState, VerifyInterface, BUS_NAME, OBJECT_PATH};
use orchestrator::SessionOrchestrator;
use providers::HttpLivenessProvider;
use resolver::CameraDeviceResolver;
use service::VerificationService;
use store::SqliteObjectStore;
use uploads::DocumentUploader;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("idgated starting");

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        camera_dir = %config.camera_dir.display(),
        db = %config.db_path.display(),
        liveness = %config.liveness_url,
        session_bus = config.session_bus,
        "configuration loaded"
    );
    if config.ids_bucket.is_none() {
        tracing::warn!("IDGATE_IDS_BUCKET is not set, document uploads will be refused");
    }

    let store = SqliteObjectStore::open(&config.db_path, &config.public_url_base)
        .await
        .context("failed to open object store")?;
    let storage = Arc::new(store.clone());

    let provider = HttpLivenessProvider::new(
        &config.liveness_url,
        config.liveness_api_key.clone(),
        Duration::from_secs(config.provider_timeout_secs),
    )
    .context("failed to build liveness client")?;

    let backend = Arc::new(ReplayCameraBackend::new(&config.camera_dir, config.camera_fps));
    let resolver = CameraDeviceResolver::new(backend, config.preferred_facing);
    let capture = capture::spawn_capture(resolver, config.capture_settings())
        .context("failed to start capture thread")?;

    let orchestrator = SessionOrchestrator::new(Arc::new(provider), storage.clone(), config.orchestrator());
    let uploader = DocumentUploader::new(
        storage,
        config.ids_bucket.clone(),
        config.ids_prefix.clone(),
        config.ids_presign,
        DOCUMENT_URL_TTL,
    );
    let machine = VerificationStateMachine::new(config.verification_policy());
    let service = VerificationService::new(capture, orchestrator, uploader, machine);

    let state = Arc::new(AppState {
        config: config.clone(),
        service: Arc::clone(&service),
        store,
    });
    let iface = VerifyInterface { state };

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    let relay = tokio::spawn(dbus_interface::forward_signals(conn.clone(), Arc::clone(&service)));

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "idgated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("idgated shutting down");

    relay.abort();
    if let Err(e) = service.restart().await {
        tracing::warn!(error = %e, "cleanup on shutdown failed");
    }

    Ok(())
}
