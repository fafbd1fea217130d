use anyhow::{Context, Result};
use attendance_core::{AttendanceLedger, FaceDetector, ModelTrainer, SampleStore};
use attendance_hw::Camera;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod enroll;
mod session;
#[cfg(test)]
mod testing;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use engine::EngineContext;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendanced starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        data_dir = %config.data_dir.display(),
        threshold = config.acceptance_threshold,
        "configuration loaded"
    );

    let store = SampleStore::open(config.samples_dir(), config.roster_path()).context("opening sample store")?;
    let ledger = AttendanceLedger::open(config.attendance_dir()).context("opening attendance ledger")?;

    let scrfd_path = config.scrfd_model_path();
    let detector = FaceDetector::load(&scrfd_path).with_context(|| format!("loading face detector from {scrfd_path}"))?;
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let (device, width, height) = (config.camera_device.clone(), config.frame_width, config.frame_height);
    let system_bus = config.system_bus;
    let context = EngineContext {
        config,
        store: Arc::new(store),
        ledger: Arc::new(ledger),
        trainer: ModelTrainer::default(),
    };
    let engine = engine::spawn_engine(context, detector, move || Camera::open(&device, width, height))?;

    let builder = if system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(engine))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = if system_bus { "system" } else { "session" }, name = BUS_NAME, "attendanced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("attendanced shutting down");

    Ok(())
}
