//! Run mode: open state, start the scan loop, serve the API.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use herd::{DirObjects, Herd};
use herd_api::{ApiState, build_router};
use herd_core::HerdConfig;
use herd_node::{JsonConnector, ObjectGetter, SubConnector};
use herd_state::StateStore;
use tokio::sync::watch;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub fn load_config(path: &Path) -> anyhow::Result<HerdConfig> {
    HerdConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

pub async fn run(config_path: &Path, data_dir: PathBuf, port: u16) -> anyhow::Result<()> {
    info!("herd daemon starting");
    let config = load_config(config_path)?;

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("herd.redb");
    let store = StateStore::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");

    let objects_dir = data_dir.join("objects");
    std::fs::create_dir_all(&objects_dir)?;
    let objects: Arc<dyn ObjectGetter> = Arc::new(DirObjects::new(&objects_dir));
    let connector: Arc<dyn SubConnector> = Arc::new(JsonConnector::new(
        CONNECT_TIMEOUT,
        Duration::from_secs(config.herd.rpc_timeout_secs),
    ));

    let herd = Arc::new(Herd::new(&config, store, connector, Some(objects))?);
    let report = if config.subs.is_empty() {
        herd.restore_mdb().await?
    } else {
        herd.sync_mdb(config.subs.clone()).await?
    };
    info!(
        subs = report.added.len(),
        images = herd.image_names()?.len(),
        "machine database loaded"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Scan loop ──────────────────────────────────────────────

    let scan_herd = Arc::clone(&herd);
    let scan_handle = tokio::spawn(async move {
        scan_herd.run(shutdown_rx).await;
    });

    // ── API server ─────────────────────────────────────────────

    let router = build_router(ApiState::new(Arc::clone(&herd), config.api.clone()));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = scan_handle.await;
    info!("herd daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herd.toml");
        std::fs::write(&path, "[limits]\nmax_concurrent_pushes = 0\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("herd.toml"));

        std::fs::write(&path, "[herd]\nscan_interval_secs = 5\n").unwrap();
        assert_eq!(load_config(&path).unwrap().herd.scan_interval_secs, 5);
    }

    #[test]
    fn missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(&dir.path().join("absent.toml")).is_err());
    }
}
