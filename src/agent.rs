use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::composer::{Composer, ContextMessage};
use crate::database::{Database, Persona, PersonaStatus};
use crate::fleet::FleetEvent;
use crate::surface::{normalize_text, ChatSurface, ObservedMessage};

/// Consecutive disconnected reads before a reconnect is attempted.
const DISCONNECT_THRESHOLD: u32 = 3;

/// How many of the persona's own recent outputs are kept for repeat
/// suppression.
const RECENT_OUTPUTS_CAP: usize = 20;

const DEDUPE_PREFIX_CHARS: usize = 10;
const DEDUPE_MIN_CHARS: usize = 5;

enum CycleOutcome {
    Continue(Duration),
    Stop,
}

/// Reactive loop for one persona: watches its channel, replies to new
/// messages behind the interval and probability gates, and keeps itself
/// attached to the surface.
pub struct ConversationAgent {
    persona_id: String,
    db: Arc<Database>,
    surface: Arc<dyn ChatSurface>,
    composer: Arc<dyn Composer>,
    events: flume::Sender<FleetEvent>,
    recovery_poll: Duration,

    last_seen_id: Option<String>,
    last_reply_at: Option<DateTime<Utc>>,
    disconnect_reads: u32,
    recent_outputs: VecDeque<String>,
    status: PersonaStatus,
}

impl ConversationAgent {
    pub fn new(
        persona_id: String,
        db: Arc<Database>,
        surface: Arc<dyn ChatSurface>,
        composer: Arc<dyn Composer>,
        events: flume::Sender<FleetEvent>,
        recovery_poll_secs: u64,
    ) -> Self {
        Self {
            persona_id,
            db,
            surface,
            composer,
            events,
            recovery_poll: Duration::from_secs(recovery_poll_secs.max(1)),
            last_seen_id: None,
            last_reply_at: None,
            disconnect_reads: 0,
            recent_outputs: VecDeque::new(),
            status: PersonaStatus::Offline,
        }
    }

    /// Runs cycles strictly one at a time until the persona is disabled,
    /// deleted, or the stop signal fires. A poke skips the current sleep
    /// and runs the next cycle immediately; gating still applies.
    pub async fn run_loop(
        mut self,
        mut stop: watch::Receiver<bool>,
        poke: Arc<tokio::sync::Notify>,
    ) {
        info!("Agent loop started for persona {}", self.persona_id);
        loop {
            if *stop.borrow() {
                break;
            }
            let delay = match self.poll_cycle().await {
                Ok(CycleOutcome::Continue(delay)) => delay,
                Ok(CycleOutcome::Stop) => break,
                Err(err) => {
                    warn!("Cycle for persona {} failed: {:#}", self.persona_id, err);
                    self.recovery_poll
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => {}
                _ = poke.notified() => {}
            }
        }
        self.set_status(PersonaStatus::Offline);
        info!("Agent loop stopped for persona {}", self.persona_id);
    }

    async fn poll_cycle(&mut self) -> Result<CycleOutcome> {
        // Config is re-read every cycle so operator edits apply live.
        let persona = match self.db.get_persona(&self.persona_id)? {
            Some(p) if p.enabled => p,
            _ => return Ok(CycleOutcome::Stop),
        };
        let listen = Duration::from_secs(persona.listen_interval_secs.max(1));

        if !self.surface.is_connected().await {
            return Ok(self.handle_disconnected(&persona).await);
        }
        if self.disconnect_reads >= DISCONNECT_THRESHOLD {
            let _ = self.events.send(FleetEvent::SurfaceRecovered {
                persona_id: self.persona_id.clone(),
            });
        }
        self.disconnect_reads = 0;
        self.set_status(PersonaStatus::Online);

        // Read a window twice the context size, keep the newest part.
        let raw = self
            .surface
            .read_recent(persona.buffer_size.max(1) * 2)
            .await?;
        let window = trim_window(raw, persona.buffer_size.max(1));

        let Some(newest) = newest_incoming(&window) else {
            return Ok(CycleOutcome::Continue(listen));
        };
        let newest_id = newest.id.clone();

        match &self.last_seen_id {
            // Cold start: record where the conversation is, reply to
            // nothing that predates this loop.
            None => {
                debug!(
                    "Persona {} anchored at message {}",
                    self.persona_id, newest_id
                );
                self.last_seen_id = Some(newest_id);
                return Ok(CycleOutcome::Continue(listen));
            }
            Some(seen) if *seen == newest_id => {
                return Ok(CycleOutcome::Continue(listen));
            }
            Some(_) => {}
        }
        // The message is consumed even if a gate below skips the reply.
        self.last_seen_id = Some(newest_id);

        if !passes_interval_gate(self.last_reply_at, Utc::now(), persona.reply_interval_secs) {
            debug!("Persona {} inside reply interval, skipping", self.persona_id);
            return Ok(CycleOutcome::Continue(listen));
        }
        let draw = rand::thread_rng().gen::<f64>() * 100.0;
        if !passes_probability_gate(draw, persona.reply_probability) {
            debug!(
                "Persona {} rolled {:.1} > {}, staying quiet",
                self.persona_id, draw, persona.reply_probability
            );
            return Ok(CycleOutcome::Continue(listen));
        }

        let context: Vec<ContextMessage> = window
            .iter()
            .map(|m| ContextMessage {
                from_self: m.from_self,
                text: m.text.clone(),
                image: m.images.first().cloned(),
            })
            .collect();
        let reply = self.composer.compose(&persona, &context, None).await?;
        if reply.is_empty() {
            return Ok(CycleOutcome::Continue(listen));
        }

        if is_duplicate_output(&self.recent_outputs, &reply) {
            // A suppressed send keeps the reply timer untouched.
            info!(
                "Persona {} suppressed a near-duplicate reply",
                self.persona_id
            );
            return Ok(CycleOutcome::Continue(listen));
        }

        self.deliver(&persona, &reply).await?;
        self.last_reply_at = Some(Utc::now());
        let _ = self.events.send(FleetEvent::ReplySent {
            persona_id: self.persona_id.clone(),
            content: reply,
        });
        Ok(CycleOutcome::Continue(listen))
    }

    async fn deliver(&mut self, persona: &Persona, reply: &str) -> Result<()> {
        let parts = split_reply(reply, persona.split_by_newline);
        let pause = Duration::from_secs(persona.multi_msg_interval_secs);
        for (i, part) in parts.iter().enumerate() {
            if i > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            self.surface.send_text(part).await?;
            self.db.record_sent_message(&self.persona_id, part)?;
            remember_output(&mut self.recent_outputs, part);
        }
        Ok(())
    }

    async fn handle_disconnected(&mut self, persona: &Persona) -> CycleOutcome {
        self.disconnect_reads += 1;
        debug!(
            "Persona {} disconnected read {}/{}",
            self.persona_id, self.disconnect_reads, DISCONNECT_THRESHOLD
        );
        if self.disconnect_reads < DISCONNECT_THRESHOLD {
            return CycleOutcome::Continue(self.recovery_poll);
        }
        if self.disconnect_reads == DISCONNECT_THRESHOLD {
            let _ = self.events.send(FleetEvent::SurfaceLost {
                persona_id: self.persona_id.clone(),
            });
        }
        self.set_status(PersonaStatus::Idle);
        match self.surface.reconnect(&persona.target_channel).await {
            Ok(true) => {
                info!("Persona {} reconnected", self.persona_id);
                // Next cycle observes the connected surface and resets.
                CycleOutcome::Continue(Duration::from_secs(0))
            }
            Ok(false) => CycleOutcome::Continue(self.recovery_poll),
            Err(err) => {
                warn!("Reconnect for persona {} failed: {:#}", self.persona_id, err);
                CycleOutcome::Continue(self.recovery_poll)
            }
        }
    }

    fn set_status(&mut self, status: PersonaStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        if let Err(err) = self.db.set_persona_status(&self.persona_id, status) {
            warn!(
                "Status update for persona {} failed: {:#}",
                self.persona_id, err
            );
        }
    }
}

/// Keeps the newest `buffer` messages of a read window.
fn trim_window(mut messages: Vec<ObservedMessage>, buffer: usize) -> Vec<ObservedMessage> {
    if messages.len() > buffer {
        messages.drain(..messages.len() - buffer);
    }
    messages
}

/// Newest message from someone else. Messages with no text at all (pure
/// image drops, stickers) never act as a trigger; they still appear in the
/// context window.
fn newest_incoming(window: &[ObservedMessage]) -> Option<&ObservedMessage> {
    window
        .iter()
        .rev()
        .find(|m| !m.from_self && !m.text.trim().is_empty())
}

fn passes_interval_gate(
    last_reply_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval_secs: u64,
) -> bool {
    match last_reply_at {
        None => true,
        Some(last) => (now - last).num_seconds() >= interval_secs as i64,
    }
}

fn passes_probability_gate(draw: f64, probability: u32) -> bool {
    draw <= probability as f64
}

/// Near-duplicate check against the persona's own recent output: exact
/// normalized match, or a recent message that starts with the candidate's
/// first ten characters (short candidates only match exactly).
fn is_duplicate_output(recent: &VecDeque<String>, candidate: &str) -> bool {
    let candidate = normalize_text(candidate);
    if candidate.is_empty() {
        return false;
    }
    let prefix: String = candidate.chars().take(DEDUPE_PREFIX_CHARS).collect();
    let long_enough = candidate.chars().count() > DEDUPE_MIN_CHARS;
    recent.iter().any(|entry| {
        entry == &candidate || (long_enough && entry.starts_with(&prefix))
    })
}

fn remember_output(recent: &mut VecDeque<String>, output: &str) {
    recent.push_back(normalize_text(output));
    while recent.len() > RECENT_OUTPUTS_CAP {
        recent.pop_front();
    }
}

fn split_reply(reply: &str, split_by_newline: bool) -> Vec<String> {
    if !split_by_newline {
        return vec![reply.to_string()];
    }
    let parts: Vec<String> = reply
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if parts.is_empty() {
        vec![reply.to_string()]
    } else {
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::testing::StubComposer;
    use crate::surface::testing::{msg, ScriptedSurface};

    fn setup(
        persona: Persona,
        surface: ScriptedSurface,
        composer: StubComposer,
    ) -> (
        tempfile::TempDir,
        Arc<Database>,
        Arc<ScriptedSurface>,
        Arc<StubComposer>,
        ConversationAgent,
        flume::Receiver<FleetEvent>,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(dir.path().join("agent_test.db")).expect("db"));
        db.upsert_persona(&persona).expect("persona");
        let surface = Arc::new(surface);
        let composer = Arc::new(composer);
        let (tx, rx) = flume::unbounded();
        let agent = ConversationAgent::new(
            persona.id.clone(),
            Arc::clone(&db),
            Arc::clone(&surface) as Arc<dyn ChatSurface>,
            Arc::clone(&composer) as Arc<dyn Composer>,
            tx,
            5,
        );
        (dir, db, surface, composer, agent, rx)
    }

    fn chatty_persona() -> Persona {
        let mut p = Persona::new("sam", "gpt-4o-mini", "group-42");
        p.reply_probability = 100;
        p.reply_interval_secs = 0;
        p.multi_msg_interval_secs = 0;
        p
    }

    #[tokio::test]
    async fn cold_start_records_without_replying() {
        let surface = ScriptedSurface::new(vec![vec![msg("m1", "anyone here?", false)]]);
        let (_dir, _db, surface, composer, mut agent, _rx) =
            setup(chatty_persona(), surface, StubComposer::new(&["hi"]));

        agent.poll_cycle().await.expect("cycle");
        agent.poll_cycle().await.expect("cycle");

        assert_eq!(composer.call_count(), 0);
        assert!(surface.sent_texts().is_empty());
        assert_eq!(agent.last_seen_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn replies_once_per_new_message() {
        let surface = ScriptedSurface::new(vec![
            vec![msg("m0", "hello", false)],
            vec![msg("m0", "hello", false), msg("m1", "anyone?", false)],
        ]);
        let (_dir, db, surface, composer, mut agent, rx) =
            setup(chatty_persona(), surface, StubComposer::new(&["here!"]));

        agent.poll_cycle().await.expect("anchor");
        agent.poll_cycle().await.expect("reply");
        // Repeated reads of the same window must not re-trigger.
        agent.poll_cycle().await.expect("idle");
        agent.poll_cycle().await.expect("idle");

        assert_eq!(composer.call_count(), 1);
        assert_eq!(surface.sent_texts(), vec!["here!"]);
        assert_eq!(
            db.recent_sent_messages(&agent.persona_id, 10).expect("db"),
            vec!["here!"]
        );
        assert!(matches!(
            rx.try_recv().expect("event"),
            FleetEvent::ReplySent { .. }
        ));
    }

    #[tokio::test]
    async fn interval_gate_consumes_message_without_reply() {
        let mut persona = chatty_persona();
        persona.reply_interval_secs = 3600;
        let surface = ScriptedSurface::new(vec![
            vec![msg("m0", "hello", false)],
            vec![msg("m1", "too soon", false)],
        ]);
        let (_dir, _db, surface, composer, mut agent, _rx) =
            setup(persona, surface, StubComposer::new(&["nope"]));

        agent.poll_cycle().await.expect("anchor");
        agent.last_reply_at = Some(Utc::now());
        agent.poll_cycle().await.expect("gated");

        assert_eq!(composer.call_count(), 0);
        assert!(surface.sent_texts().is_empty());
        assert_eq!(agent.last_seen_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn duplicate_reply_is_suppressed_and_timer_unchanged() {
        let surface = ScriptedSurface::new(vec![
            vec![msg("m0", "hello", false)],
            vec![msg("m1", "first", false)],
            vec![msg("m2", "second", false)],
        ]);
        let (_dir, _db, surface, _composer, mut agent, _rx) = setup(
            chatty_persona(),
            surface,
            StubComposer::new(&["same old line", "same old line"]),
        );

        agent.poll_cycle().await.expect("anchor");
        agent.poll_cycle().await.expect("reply");
        let first_reply_at = agent.last_reply_at.expect("set");

        agent.poll_cycle().await.expect("suppressed");
        assert_eq!(surface.sent_texts(), vec!["same old line"]);
        assert_eq!(agent.last_reply_at, Some(first_reply_at));
    }

    #[tokio::test]
    async fn split_replies_go_out_line_by_line() {
        let mut persona = chatty_persona();
        persona.split_by_newline = true;
        let surface = ScriptedSurface::new(vec![
            vec![msg("m0", "hello", false)],
            vec![msg("m1", "tell me more", false)],
        ]);
        let (_dir, db, surface, _composer, mut agent, _rx) = setup(
            persona,
            surface,
            StubComposer::new(&["one\ntwo\n\nthree"]),
        );

        agent.poll_cycle().await.expect("anchor");
        agent.poll_cycle().await.expect("reply");

        assert_eq!(surface.sent_texts(), vec!["one", "two", "three"]);
        assert_eq!(
            db.recent_sent_messages(&agent.persona_id, 10)
                .expect("db")
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn own_messages_are_never_replied_to() {
        let surface = ScriptedSurface::new(vec![
            vec![msg("m0", "hello", false)],
            vec![msg("m0", "hello", false), msg("m1", "my own echo", true)],
        ]);
        let (_dir, _db, surface, composer, mut agent, _rx) =
            setup(chatty_persona(), surface, StubComposer::new(&["reply"]));

        agent.poll_cycle().await.expect("anchor");
        agent.poll_cycle().await.expect("idle");

        assert_eq!(composer.call_count(), 0);
        assert!(surface.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn reconnect_after_three_disconnected_reads() {
        let surface = ScriptedSurface::new(vec![vec![]]).disconnected();
        let (_dir, db, surface, _composer, mut agent, rx) =
            setup(chatty_persona(), surface, StubComposer::new(&[]));

        agent.poll_cycle().await.expect("one");
        agent.poll_cycle().await.expect("two");
        assert_eq!(surface.reconnect_calls(), 0);

        agent.poll_cycle().await.expect("three");
        assert_eq!(surface.reconnect_calls(), 1);
        assert!(matches!(
            rx.try_recv().expect("event"),
            FleetEvent::SurfaceLost { .. }
        ));
        let persona = db.get_persona(&agent.persona_id).expect("q").expect("found");
        assert_eq!(persona.status, PersonaStatus::Idle);
    }

    #[tokio::test]
    async fn failed_reconnect_keeps_retrying_at_recovery_cadence() {
        let surface = ScriptedSurface::new(vec![vec![]])
            .disconnected()
            .failing_reconnect();
        let (_dir, _db, surface, _composer, mut agent, _rx) =
            setup(chatty_persona(), surface, StubComposer::new(&[]));

        for _ in 0..5 {
            match agent.poll_cycle().await.expect("cycle") {
                CycleOutcome::Continue(delay) => {
                    assert_eq!(delay, agent.recovery_poll);
                }
                CycleOutcome::Stop => panic!("loop must keep retrying"),
            }
        }
        // Cycles past the threshold retry the reconnect every time.
        assert_eq!(surface.reconnect_calls(), 3);
    }

    #[tokio::test]
    async fn disabled_persona_stops_the_loop() {
        let mut persona = chatty_persona();
        let surface = ScriptedSurface::new(vec![vec![]]);
        let (_dir, db, _surface, _composer, mut agent, _rx) =
            setup(persona.clone(), surface, StubComposer::new(&[]));

        persona.enabled = false;
        db.upsert_persona(&persona).expect("disable");

        assert!(matches!(
            agent.poll_cycle().await.expect("cycle"),
            CycleOutcome::Stop
        ));
    }

    #[test]
    fn interval_gate_logic() {
        let now = Utc::now();
        assert!(passes_interval_gate(None, now, 60));
        assert!(!passes_interval_gate(
            Some(now - chrono::Duration::seconds(30)),
            now,
            60
        ));
        assert!(passes_interval_gate(
            Some(now - chrono::Duration::seconds(61)),
            now,
            60
        ));
    }

    #[test]
    fn probability_gate_boundaries() {
        assert!(passes_probability_gate(0.0, 0));
        assert!(!passes_probability_gate(0.1, 0));
        assert!(passes_probability_gate(99.9, 100));
        assert!(passes_probability_gate(50.0, 50));
        assert!(!passes_probability_gate(50.1, 50));
    }

    #[test]
    fn probability_extremes_hold_over_many_trials() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let draw = rng.gen::<f64>() * 100.0;
            assert!(passes_probability_gate(draw, 100));
            if draw > 0.0 {
                assert!(!passes_probability_gate(draw, 0));
            }
        }
    }

    #[test]
    fn duplicate_detection_uses_prefix_for_long_outputs() {
        let mut recent = VecDeque::new();
        remember_output(&mut recent, "The market looks calm today, honestly.");

        assert!(is_duplicate_output(
            &recent,
            "the market looks calm today, honestly."
        ));
        assert!(is_duplicate_output(&recent, "The market looks different now"));
        assert!(!is_duplicate_output(&recent, "Something else entirely"));
        // Short candidates only match exactly.
        assert!(!is_duplicate_output(&recent, "The m"));
    }

    #[test]
    fn recent_outputs_fifo_caps_at_twenty() {
        let mut recent = VecDeque::new();
        for i in 0..25 {
            remember_output(&mut recent, &format!("message number {}", i));
        }
        assert_eq!(recent.len(), RECENT_OUTPUTS_CAP);
        assert_eq!(recent.front().map(String::as_str), Some("message number 5"));
    }

    #[test]
    fn window_trims_to_newest_and_skips_self() {
        let window = trim_window(
            vec![
                msg("a", "1", false),
                msg("b", "2", false),
                msg("c", "3", true),
            ],
            2,
        );
        assert_eq!(window.len(), 2);
        assert_eq!(newest_incoming(&window).map(|m| m.id.as_str()), Some("b"));
    }
}
