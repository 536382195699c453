use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::composer::Composer;
use crate::database::{ContentItem, ContentType, Database, Persona, WorkMode};
use crate::fleet::FleetEvent;
use crate::pool::ContentPool;
use crate::prompts;
use crate::surface::ChatSurface;

/// Re-check cadence while a persona has proactive posting switched off.
const DISABLED_RECHECK_SECS: u64 = 60;

/// One-shot rearming timer for a persona's unprompted posts. Each fire
/// draws a fresh interval from [min, max]; a persona that has never fired
/// (or whose last fire is older than max) posts immediately.
pub struct ProactiveScheduler {
    persona_id: String,
    db: Arc<Database>,
    pool: Arc<ContentPool>,
    surface: Arc<dyn ChatSurface>,
    composer: Arc<dyn Composer>,
    events: flume::Sender<FleetEvent>,
}

impl ProactiveScheduler {
    pub fn new(
        persona_id: String,
        db: Arc<Database>,
        pool: Arc<ContentPool>,
        surface: Arc<dyn ChatSurface>,
        composer: Arc<dyn Composer>,
        events: flume::Sender<FleetEvent>,
    ) -> Self {
        Self {
            persona_id,
            db,
            pool,
            surface,
            composer,
            events,
        }
    }

    pub async fn run_loop(self, mut stop: watch::Receiver<bool>) {
        info!("Proactive loop started for persona {}", self.persona_id);
        loop {
            if *stop.borrow() {
                break;
            }
            let persona = match self.db.get_persona(&self.persona_id) {
                Ok(Some(p)) if p.enabled => p,
                Ok(_) => break,
                Err(err) => {
                    warn!(
                        "Persona {} load failed in proactive loop: {:#}",
                        self.persona_id, err
                    );
                    break;
                }
            };
            if !persona.proactive_enabled {
                if sleep_or_stop(Duration::from_secs(DISABLED_RECHECK_SECS), &mut stop).await {
                    break;
                }
                continue;
            }

            let wait = self.time_until_due(&persona);
            if !wait.is_zero() && sleep_or_stop(wait, &mut stop).await {
                break;
            }

            match self.fire_once().await {
                // Fired: the refreshed last_proactive_at drives the next draw.
                Ok(true) => {}
                Ok(false) => {
                    // Nothing to post right now; rearm quietly.
                    let rearm = draw_interval(
                        persona.proactive_interval_min_secs,
                        persona.proactive_interval_max_secs,
                    );
                    if sleep_or_stop(Duration::from_secs(rearm), &mut stop).await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(
                        "Proactive fire for persona {} failed: {:#}",
                        self.persona_id, err
                    );
                    let rearm = draw_interval(
                        persona.proactive_interval_min_secs,
                        persona.proactive_interval_max_secs,
                    );
                    if sleep_or_stop(Duration::from_secs(rearm), &mut stop).await {
                        break;
                    }
                }
            }
        }
        info!("Proactive loop stopped for persona {}", self.persona_id);
    }

    fn time_until_due(&self, persona: &Persona) -> Duration {
        let Some(last) = persona.last_proactive_at else {
            return Duration::ZERO;
        };
        let elapsed = (Utc::now() - last).num_seconds().max(0) as u64;
        if elapsed >= persona.proactive_interval_max_secs {
            return Duration::ZERO;
        }
        let drawn = draw_interval(
            persona.proactive_interval_min_secs,
            persona.proactive_interval_max_secs,
        );
        Duration::from_secs(drawn.saturating_sub(elapsed))
    }

    /// One posting attempt. Returns true when something was sent; silent
    /// skips (disabled, disconnected, empty pool) return false.
    pub async fn fire_once(&self) -> Result<bool> {
        let persona = match self.db.get_persona(&self.persona_id)? {
            Some(p) if p.enabled && p.proactive_enabled => p,
            _ => return Ok(false),
        };
        if !self.surface.is_connected().await {
            debug!(
                "Persona {} surface not connected, skipping proactive post",
                self.persona_id
            );
            return Ok(false);
        }
        let Some((item, source)) = self.pool.get_available_item(&persona.id)? else {
            debug!("Pool has nothing for persona {}", self.persona_id);
            return Ok(false);
        };

        let sent_content = match item.content_type {
            ContentType::Image => {
                let data_url = self.pool.image_data_url(&item)?;
                // The item title captions the image; comment mode lets the
                // model write one first and keeps the title as fallback.
                let caption = match source.work_mode {
                    WorkMode::Comment => self
                        .compose_image_caption(&persona, &data_url)
                        .await
                        .or_else(|| item.title.clone()),
                    WorkMode::Forward => item.title.clone(),
                };
                self.surface
                    .send_image(&data_url, caption.as_deref())
                    .await?;
                caption.unwrap_or_else(|| "[image]".to_string())
            }
            ContentType::Text | ContentType::Price => {
                let text = match source.work_mode {
                    WorkMode::Forward => forward_text(&item),
                    WorkMode::Comment => match self.compose_comment(&persona, &item).await {
                        Some(comment) => comment,
                        // Model trouble must not silence the persona.
                        None => forward_text(&item),
                    },
                };
                if text.trim().is_empty() {
                    return Ok(false);
                }
                self.surface.send_text(&text).await?;
                text
            }
        };

        let usage = if item.content_type == ContentType::Image {
            "[image]".to_string()
        } else {
            sent_content.clone()
        };
        self.pool
            .mark_item_used(&item.id, &persona.id, Some(&usage))?;
        self.db.record_sent_message(&persona.id, &sent_content)?;
        self.db.touch_last_proactive(&persona.id, Utc::now())?;
        info!(
            "Persona {} posted item {} from source {}",
            self.persona_id, item.id, source.name
        );
        let _ = self.events.send(FleetEvent::ProactiveSent {
            persona_id: self.persona_id.clone(),
            item_id: item.id.clone(),
        });
        Ok(true)
    }

    /// Caption for an image post. The image itself is only attached when
    /// the persona has image recognition enabled.
    async fn compose_image_caption(&self, persona: &Persona, data_url: &str) -> Option<String> {
        let context = [crate::composer::ContextMessage {
            from_self: false,
            text: String::new(),
            image: Some(data_url.to_string()),
        }];
        let instruction = prompts::image_comment_prompt(&persona.locale);
        match self
            .composer
            .compose(persona, &context, Some(instruction))
            .await
        {
            Ok(caption) if !caption.trim().is_empty() => Some(caption),
            Ok(_) => None,
            Err(err) => {
                warn!(
                    "Image caption for persona {} failed: {:#}",
                    self.persona_id, err
                );
                None
            }
        }
    }

    async fn compose_comment(&self, persona: &Persona, item: &ContentItem) -> Option<String> {
        let instruction = comment_instruction(persona, item);
        match self.composer.compose(persona, &[], Some(&instruction)).await {
            Ok(comment) if !comment.trim().is_empty() => Some(comment),
            Ok(_) => None,
            Err(err) => {
                warn!(
                    "Comment for persona {} failed: {:#}",
                    self.persona_id, err
                );
                None
            }
        }
    }
}

/// True when the stop signal fired during the sleep.
async fn sleep_or_stop(wait: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        _ = stop.changed() => {}
    }
    *stop.borrow()
}

pub fn draw_interval(min_secs: u64, max_secs: u64) -> u64 {
    if max_secs <= min_secs {
        return min_secs;
    }
    rand::thread_rng().gen_range(min_secs..=max_secs)
}

/// Verbatim forward: the item body, falling back to the title, with the
/// source link appended on its own paragraph.
pub fn forward_text(item: &ContentItem) -> String {
    let mut text = item
        .body
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .or(item.title.as_deref())
        .unwrap_or_default()
        .to_string();
    if let Some(url) = item.source_url.as_deref() {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(url);
    }
    text
}

/// Fact sheet handed to the model in comment mode.
fn fact_sheet(item: &ContentItem) -> String {
    let mut lines = Vec::new();
    if let Some(title) = item.title.as_deref() {
        lines.push(format!("Title: {}", title));
    }
    if let Some(body) = item.body.as_deref() {
        lines.push(format!("Content: {}", body));
    }
    if let Some(value) = item.price_value {
        lines.push(format!("Price: ${}", crate::pool::price::format_price(value)));
    }
    if let Some(change) = item.price_change {
        lines.push(format!("24h change: {:+.2}%", change));
    }
    if let Some(url) = item.source_url.as_deref() {
        lines.push(format!("Source: {}", url));
    }
    lines.join("\n")
}

fn comment_instruction(persona: &Persona, item: &ContentItem) -> String {
    let task = persona
        .proactive_prompt
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| prompts::proactive_prompt(&persona.locale));
    format!("{}\n\n{}", task, fact_sheet(item))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::testing::StubComposer;
    use crate::database::{ContentSource, NewItem, SourceKind};
    use crate::surface::testing::{ScriptedSurface, SentRecord};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        pool: Arc<ContentPool>,
        surface: Arc<ScriptedSurface>,
        persona: Persona,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(dir.path().join("proactive_test.db")).expect("db"));
        let pool = Arc::new(ContentPool::new(Arc::clone(&db), dir.path().join("uploads")));
        let mut persona = Persona::new("sam", "gpt-4o-mini", "group-42");
        persona.proactive_enabled = true;
        db.upsert_persona(&persona).expect("persona");
        Fixture {
            _dir: dir,
            db,
            pool,
            surface: Arc::new(ScriptedSurface::new(vec![vec![]])),
            persona,
        }
    }

    fn scheduler(
        fx: &Fixture,
        composer: StubComposer,
    ) -> (ProactiveScheduler, flume::Receiver<FleetEvent>) {
        let (tx, rx) = flume::unbounded();
        let sched = ProactiveScheduler::new(
            fx.persona.id.clone(),
            Arc::clone(&fx.db),
            Arc::clone(&fx.pool),
            Arc::clone(&fx.surface) as Arc<dyn ChatSurface>,
            Arc::new(composer) as Arc<dyn Composer>,
            tx,
        );
        (sched, rx)
    }

    fn seed_text_item(fx: &Fixture, work_mode: WorkMode, body: &str) -> String {
        let mut source = ContentSource::new("feedish", SourceKind::ManualText);
        source.work_mode = work_mode;
        fx.db.upsert_source(&source).expect("source");
        fx.db
            .create_item(
                &source.id,
                NewItem {
                    title: Some("headline".to_string()),
                    body: Some(body.to_string()),
                    source_url: Some("https://example.com/a".to_string()),
                    ..Default::default()
                },
            )
            .expect("insert")
            .expect("created")
    }

    #[test]
    fn interval_draws_rerandomize_across_the_bounds() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let drawn = draw_interval(10, 20);
            assert!((10..=20).contains(&drawn));
            seen.insert(drawn);
        }
        // 1000 draws over 11 values must not collapse to a constant and
        // all but certainly hit both endpoints.
        assert!(seen.len() > 5, "draws collapsed to {:?}", seen);
        assert!(seen.contains(&10));
        assert!(seen.contains(&20));

        assert_eq!(draw_interval(30, 30), 30);
        assert_eq!(draw_interval(40, 10), 40);
    }

    #[test]
    fn forward_text_prefers_body_and_appends_link() {
        let fx = fixture();
        let item_id = seed_text_item(&fx, WorkMode::Forward, "the story");
        let item = fx.db.get_item(&item_id).expect("q").expect("found");
        assert_eq!(forward_text(&item), "the story\n\nhttps://example.com/a");
    }

    #[tokio::test]
    async fn forward_mode_sends_item_verbatim() {
        let fx = fixture();
        let item_id = seed_text_item(&fx, WorkMode::Forward, "the story");
        let (sched, _events) = scheduler(&fx, StubComposer::new(&[]));

        assert!(sched.fire_once().await.expect("fire"));
        assert_eq!(
            fx.surface.sent_texts(),
            vec!["the story\n\nhttps://example.com/a"]
        );
        let usage = fx
            .db
            .get_usage(&item_id, &fx.persona.id)
            .expect("q")
            .expect("recorded");
        assert_eq!(
            usage.sent_content.as_deref(),
            Some("the story\n\nhttps://example.com/a")
        );
        let persona = fx.db.get_persona(&fx.persona.id).expect("q").expect("found");
        assert!(persona.last_proactive_at.is_some());
    }

    #[tokio::test]
    async fn comment_mode_posts_the_composed_text() {
        let fx = fixture();
        seed_text_item(&fx, WorkMode::Comment, "the story");
        let composer = StubComposer::new(&["hot take about the story"]);
        let (sched, events) = scheduler(&fx, composer);

        assert!(sched.fire_once().await.expect("fire"));
        assert_eq!(fx.surface.sent_texts(), vec!["hot take about the story"]);
        assert!(matches!(
            events.try_recv().expect("event"),
            FleetEvent::ProactiveSent { .. }
        ));
    }

    #[tokio::test]
    async fn comment_failure_falls_back_to_forwarding() {
        let fx = fixture();
        seed_text_item(&fx, WorkMode::Comment, "the story");
        let (sched, _events) = scheduler(&fx, StubComposer::failing());

        assert!(sched.fire_once().await.expect("fire"));
        assert_eq!(
            fx.surface.sent_texts(),
            vec!["the story\n\nhttps://example.com/a"]
        );
    }

    #[tokio::test]
    async fn empty_pool_is_a_silent_skip() {
        let fx = fixture();
        let (sched, _events) = scheduler(&fx, StubComposer::new(&[]));

        assert!(!sched.fire_once().await.expect("fire"));
        assert!(fx.surface.sent_texts().is_empty());
        let persona = fx.db.get_persona(&fx.persona.id).expect("q").expect("found");
        assert!(persona.last_proactive_at.is_none());
    }

    #[tokio::test]
    async fn proactive_disabled_skips_without_posting() {
        let mut fx = fixture();
        seed_text_item(&fx, WorkMode::Forward, "the story");
        fx.persona.proactive_enabled = false;
        fx.db.upsert_persona(&fx.persona).expect("update");
        let (sched, _events) = scheduler(&fx, StubComposer::new(&[]));

        assert!(!sched.fire_once().await.expect("fire"));
        assert!(fx.surface.sent_texts().is_empty());
    }

    fn seed_image_item(fx: &Fixture, work_mode: WorkMode, title: Option<&str>) -> String {
        let mut source = ContentSource::new("drops", SourceKind::ManualImage);
        source.work_mode = work_mode;
        fx.db.upsert_source(&source).expect("source");
        fx.db
            .create_item(
                &source.id,
                NewItem {
                    content_type: Some(ContentType::Image),
                    title: title.map(str::to_string),
                    body: Some("data:image/png;base64,AAAA".to_string()),
                    ..Default::default()
                },
            )
            .expect("insert")
            .expect("created")
    }

    #[tokio::test]
    async fn forwarded_image_carries_the_title_as_caption() {
        let fx = fixture();
        let item_id = seed_image_item(&fx, WorkMode::Forward, Some("pic title"));
        let (sched, _events) = scheduler(&fx, StubComposer::new(&[]));

        assert!(sched.fire_once().await.expect("fire"));
        let sent = fx.surface.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![SentRecord::Image {
                caption: Some("pic title".to_string())
            }]
        );
        let usage = fx
            .db
            .get_usage(&item_id, &fx.persona.id)
            .expect("q")
            .expect("recorded");
        assert_eq!(usage.sent_content.as_deref(), Some("[image]"));
    }

    #[tokio::test]
    async fn image_caption_falls_back_to_the_title_when_the_model_fails() {
        let fx = fixture();
        seed_image_item(&fx, WorkMode::Comment, Some("pic title"));
        let (sched, _events) = scheduler(&fx, StubComposer::failing());

        assert!(sched.fire_once().await.expect("fire"));
        let sent = fx.surface.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![SentRecord::Image {
                caption: Some("pic title".to_string())
            }]
        );
    }

    #[tokio::test]
    async fn untitled_image_goes_out_without_a_caption() {
        let fx = fixture();
        seed_image_item(&fx, WorkMode::Forward, None);
        let (sched, _events) = scheduler(&fx, StubComposer::new(&[]));

        assert!(sched.fire_once().await.expect("fire"));
        let sent = fx.surface.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![SentRecord::Image { caption: None }]);
    }
}
