use anyhow::{Context, Result};
use chorus::config::ServiceConfig;
use chorus::database::{Database, PersonaStatus};
use chorus::fleet::FleetSupervisor;
use chorus::pool::ContentPool;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chorus=debug")),
        )
        .init();

    let config = ServiceConfig::load();
    std::fs::create_dir_all(&config.upload_dir)
        .with_context(|| format!("Failed to create upload dir {}", config.upload_dir))?;

    let db = Arc::new(Database::new(&config.database_path).context("Failed to open database")?);
    let pool = Arc::new(ContentPool::new(Arc::clone(&db), &config.upload_dir));

    // Nothing is running yet, whatever the last shutdown left behind.
    for persona in db.list_enabled_personas()? {
        db.set_persona_status(&persona.id, PersonaStatus::Offline)?;
    }

    let fleet = Arc::new(FleetSupervisor::new(
        Arc::clone(&db),
        Arc::clone(&pool),
        config.recovery_poll_secs,
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let ingestion = pool.spawn_ingestion(stop_rx.clone());
    let maintenance = pool.spawn_maintenance(config.maintenance_interval_secs, stop_rx.clone());

    let events = fleet.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            tracing::info!("Fleet event: {:?}", event);
        }
    });

    tracing::info!(
        "chorus is up; personas go live once the operator layer registers their chat surfaces"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    fleet.stop_all().await;
    let _ = stop_tx.send(true);
    let _ = ingestion.await;
    let _ = maintenance.await;
    Ok(())
}
