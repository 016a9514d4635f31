use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod worker;

use config::{Bus, Config};
use dbus_interface::{FacetagService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facetagd starting");

    let config = Config::load().context("failed to load configuration")?;
    let worker = worker::spawn_worker(&config)
        .await
        .context("failed to start worker")?;

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FacetagService::new(worker.clone()))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(
        bus = ?config.bus,
        synchronous = config.settings.synchronous,
        "facetagd ready"
    );

    let cron = (config.queue.cron_interval_secs > 0).then(|| {
        let worker = worker.clone();
        let period = Duration::from_secs(config.queue.cron_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = worker.run_queues().await {
                    tracing::warn!(error = %e, "scheduled queue run failed");
                }
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("facetagd shutting down");
    if let Some(task) = cron {
        task.abort();
    }

    Ok(())
}
