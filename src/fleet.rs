use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::agent::ConversationAgent;
use crate::composer::{Composer, ReplyComposer};
use crate::database::Database;
use crate::pool::ContentPool;
use crate::proactive::ProactiveScheduler;
use crate::surface::ChatSurface;

/// Backoff before restarting a persona's loops after an unexpected exit.
const RESTART_BACKOFF_SECS: u64 = 5;

/// Fleet-wide notification stream for operators and logging.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    PersonaStarted { persona_id: String },
    PersonaStopped { persona_id: String },
    ReplySent { persona_id: String, content: String },
    ProactiveSent { persona_id: String, item_id: String },
    SurfaceLost { persona_id: String },
    SurfaceRecovered { persona_id: String },
}

struct PersonaHandles {
    stop: watch::Sender<bool>,
    poke: Arc<Notify>,
    watchdog: tokio::task::JoinHandle<()>,
}

/// Owns the per-persona loop pairs and their surface bindings. All
/// capability lookups go through here; nothing in the fleet is global.
pub struct FleetSupervisor {
    db: Arc<Database>,
    pool: Arc<ContentPool>,
    composer: Arc<dyn Composer>,
    recovery_poll_secs: u64,
    events_tx: flume::Sender<FleetEvent>,
    events_rx: flume::Receiver<FleetEvent>,
    surfaces: StdMutex<HashMap<String, Arc<dyn ChatSurface>>>,
    running: Mutex<HashMap<String, PersonaHandles>>,
}

impl FleetSupervisor {
    pub fn new(db: Arc<Database>, pool: Arc<ContentPool>, recovery_poll_secs: u64) -> Self {
        Self::with_composer(db, pool, recovery_poll_secs, Arc::new(ReplyComposer))
    }

    pub fn with_composer(
        db: Arc<Database>,
        pool: Arc<ContentPool>,
        recovery_poll_secs: u64,
        composer: Arc<dyn Composer>,
    ) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            db,
            pool,
            composer,
            recovery_poll_secs,
            events_tx,
            events_rx,
            surfaces: StdMutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<FleetEvent> {
        self.events_rx.clone()
    }

    // ========================================================================
    // Surface bindings
    // ========================================================================

    /// Binds a connected chat surface to a persona. Must happen before the
    /// persona's loops can start.
    pub fn register_surface(&self, persona_id: &str, surface: Arc<dyn ChatSurface>) -> Result<()> {
        let mut surfaces = self
            .surfaces
            .lock()
            .map_err(|e| anyhow::anyhow!("Surface registry lock poisoned: {}", e))?;
        surfaces.insert(persona_id.to_string(), surface);
        info!("Surface registered for persona {}", persona_id);
        Ok(())
    }

    /// Stops the persona's loops (if running) and drops its surface.
    pub async fn deregister_surface(&self, persona_id: &str) -> Result<()> {
        if self.is_running(persona_id).await {
            self.stop_persona(persona_id).await?;
        }
        let mut surfaces = self
            .surfaces
            .lock()
            .map_err(|e| anyhow::anyhow!("Surface registry lock poisoned: {}", e))?;
        surfaces.remove(persona_id);
        info!("Surface deregistered for persona {}", persona_id);
        Ok(())
    }

    fn surface_for(&self, persona_id: &str) -> Result<Arc<dyn ChatSurface>> {
        let surfaces = self
            .surfaces
            .lock()
            .map_err(|e| anyhow::anyhow!("Surface registry lock poisoned: {}", e))?;
        surfaces
            .get(persona_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No chat surface registered for persona {}", persona_id))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn is_running(&self, persona_id: &str) -> bool {
        self.running.lock().await.contains_key(persona_id)
    }

    /// Starts the agent + proactive loop pair for a persona. The watchdog
    /// restarts the pair if it ever exits without a stop request, so one
    /// crashed persona never takes the fleet down.
    pub async fn start_persona(&self, persona_id: &str) -> Result<()> {
        let persona = self
            .db
            .get_persona(persona_id)?
            .ok_or_else(|| anyhow::anyhow!("Unknown persona {}", persona_id))?;
        if !persona.enabled {
            anyhow::bail!("Persona {} is disabled", persona_id);
        }
        let surface = self.surface_for(persona_id)?;

        let mut running = self.running.lock().await;
        if running.contains_key(persona_id) {
            anyhow::bail!("Persona {} is already running", persona_id);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let poke = Arc::new(Notify::new());
        let watchdog = self.spawn_watchdog(
            persona_id.to_string(),
            surface,
            stop_rx,
            Arc::clone(&poke),
        );
        running.insert(
            persona_id.to_string(),
            PersonaHandles {
                stop: stop_tx,
                poke,
                watchdog,
            },
        );
        let _ = self.events_tx.send(FleetEvent::PersonaStarted {
            persona_id: persona_id.to_string(),
        });
        Ok(())
    }

    fn spawn_watchdog(
        &self,
        persona_id: String,
        surface: Arc<dyn ChatSurface>,
        stop: watch::Receiver<bool>,
        poke: Arc<Notify>,
    ) -> tokio::task::JoinHandle<()> {
        let db = Arc::clone(&self.db);
        let pool = Arc::clone(&self.pool);
        let composer = Arc::clone(&self.composer);
        let events = self.events_tx.clone();
        let recovery_poll_secs = self.recovery_poll_secs;
        tokio::spawn(async move {
            loop {
                let agent = ConversationAgent::new(
                    persona_id.clone(),
                    Arc::clone(&db),
                    Arc::clone(&surface),
                    Arc::clone(&composer),
                    events.clone(),
                    recovery_poll_secs,
                );
                let scheduler = ProactiveScheduler::new(
                    persona_id.clone(),
                    Arc::clone(&db),
                    Arc::clone(&pool),
                    Arc::clone(&surface),
                    Arc::clone(&composer),
                    events.clone(),
                );
                let mut stop_rx = stop.clone();
                tokio::join!(
                    agent.run_loop(stop.clone(), Arc::clone(&poke)),
                    scheduler.run_loop(stop.clone()),
                );
                if *stop.borrow() {
                    break;
                }
                // Loops end on their own when the persona disappears or is
                // disabled; only restart a persona that should be running.
                match db.get_persona(&persona_id) {
                    Ok(Some(p)) if p.enabled => {
                        warn!(
                            "Loops for persona {} exited unexpectedly, restarting",
                            persona_id
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(RESTART_BACKOFF_SECS)) => {}
                            _ = stop_rx.changed() => {}
                        }
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        })
    }

    /// Stops a persona's loops and waits for them to wind down.
    pub async fn stop_persona(&self, persona_id: &str) -> Result<()> {
        let handles = self
            .running
            .lock()
            .await
            .remove(persona_id)
            .ok_or_else(|| anyhow::anyhow!("Persona {} is not running", persona_id))?;
        let _ = handles.stop.send(true);
        if let Err(err) = handles.watchdog.await {
            warn!("Watchdog for persona {} panicked: {}", persona_id, err);
        }
        let _ = self.events_tx.send(FleetEvent::PersonaStopped {
            persona_id: persona_id.to_string(),
        });
        info!("Persona {} stopped", persona_id);
        Ok(())
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop_persona(&id).await {
                warn!("Stopping persona {} failed: {:#}", id, err);
            }
        }
    }

    // ========================================================================
    // Operator hooks
    // ========================================================================

    /// Loops reload their persona row at the top of every cycle, so config
    /// edits need no action here.
    pub fn on_config_changed(&self, persona_id: &str) {
        debug!(
            "Config change for persona {} applies on its next cycle",
            persona_id
        );
    }

    /// Manual test-fire of the reactive loop: skips the current sleep, the
    /// gating logic still decides whether anything is sent.
    pub async fn trigger_reply_once(&self, persona_id: &str) -> Result<()> {
        let running = self.running.lock().await;
        let handles = running
            .get(persona_id)
            .ok_or_else(|| anyhow::anyhow!("Persona {} is not running", persona_id))?;
        handles.poke.notify_one();
        Ok(())
    }

    /// Manual test-fire of a proactive post, bypassing only the wait.
    pub async fn trigger_proactive_once(&self, persona_id: &str) -> Result<bool> {
        let surface = self.surface_for(persona_id)?;
        let scheduler = ProactiveScheduler::new(
            persona_id.to_string(),
            Arc::clone(&self.db),
            Arc::clone(&self.pool),
            surface,
            Arc::clone(&self.composer),
            self.events_tx.clone(),
        );
        scheduler.fire_once().await
    }
}
