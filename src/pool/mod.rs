use anyhow::{Context, Result};
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::database::{
    ContentItem, ContentSource, ContentType, Database, NewItem, PoolStats, SourceKind,
};

pub mod feed;
pub mod price;

/// Selection draws from the newest items only, so stale-but-live entries
/// do not dominate busy feeds.
const CANDIDATE_WINDOW: usize = 10;

/// Cadence of the ingestion scheduler scan; each source still fetches at
/// its own fetch_interval_secs.
const SCAN_INTERVAL_SECS: u64 = 30;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared store of postable material. Personas draw from it for proactive
/// posts; ingestion workers keep it filled from feeds and price tickers.
pub struct ContentPool {
    db: Arc<Database>,
    upload_dir: PathBuf,
    http: reqwest::Client,
}

impl ContentPool {
    pub fn new(db: Arc<Database>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            upload_dir: upload_dir.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Picks one live item the persona is allowed to post, or None when the
    /// pool has nothing for it. Sources are tried in random order; within a
    /// source the pick is uniform over the newest eligible items.
    ///
    /// Reuse precedence per source: allow_same_persona_reuse admits
    /// everything, reusable excludes only this persona's own history, and
    /// the default excludes anything any persona has used.
    pub fn get_available_item(
        &self,
        persona_id: &str,
    ) -> Result<Option<(ContentItem, ContentSource)>> {
        let mut sources = self.db.list_enabled_sources()?;
        let mut rng = rand::thread_rng();
        sources.shuffle(&mut rng);

        for source in sources {
            if self.db.count_live_items(&source.id)? == 0 {
                continue;
            }
            let exclude = if source.allow_same_persona_reuse {
                Vec::new()
            } else if source.reusable {
                self.db.used_item_ids_for_persona(&source.id, persona_id)?
            } else {
                self.db.used_item_ids_any(&source.id)?
            };
            let candidates =
                self.db
                    .recent_eligible_items(&source.id, &exclude, CANDIDATE_WINDOW)?;
            if let Some(item) = candidates.choose(&mut rng) {
                debug!(
                    "Pool pick for persona {}: item {} from source {}",
                    persona_id, item.id, source.name
                );
                return Ok(Some((item.clone(), source)));
            }
        }
        Ok(None)
    }

    /// Records that the persona posted this item. Must be called after a
    /// successful send so exclusive items stop being offered.
    pub fn mark_item_used(
        &self,
        item_id: &str,
        persona_id: &str,
        sent_content: Option<&str>,
    ) -> Result<()> {
        self.db.upsert_usage(item_id, persona_id, sent_content)
    }

    pub fn add_item(&self, source_id: &str, item: NewItem) -> Result<Option<String>> {
        self.db.create_item(source_id, item)
    }

    /// Turns an image item into a base64 data URL ready for the surface.
    /// Items ingested with an inline data URL body pass through unchanged;
    /// uploaded files are read from the upload dir.
    pub fn image_data_url(&self, item: &ContentItem) -> Result<String> {
        if let Some(body) = item.body.as_deref() {
            if body.starts_with("data:") {
                return Ok(body.to_string());
            }
        }
        let rel = item
            .image_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Image item {} has no backing file", item.id))?;
        let path = self.upload_dir.join(rel);
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read image file {}", path.display()))?;
        let mime = match path.extension().and_then(|e| e.to_str()) {
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            _ => "image/jpeg",
        };
        Ok(format!(
            "data:{};base64,{}",
            mime,
            base64::engine::general_purpose::STANDARD.encode(bytes)
        ))
    }

    pub fn stats(&self) -> Result<PoolStats> {
        self.db.pool_stats()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flags items older than each source's expire_hours. Expired items
    /// leave the candidate window but keep their usage history.
    pub fn sweep_expired(&self) -> Result<usize> {
        let mut flagged = 0;
        for source in self.db.list_sources()? {
            let cutoff = Utc::now() - ChronoDuration::hours(source.expire_hours);
            flagged += self.db.mark_expired_before(&source.id, cutoff)?;
        }
        if flagged > 0 {
            info!("Expiry sweep flagged {} item(s)", flagged);
        }
        Ok(flagged)
    }

    /// Hard-deletes items (record and backing file) past the purge horizon
    /// for sources that set one. Everything else only ever expires.
    pub fn purge_ephemeral(&self) -> Result<usize> {
        let mut purged = 0;
        for source in self.db.list_sources()? {
            let Some(purge_hours) = source.purge_hours else {
                continue;
            };
            let cutoff = Utc::now() - ChronoDuration::hours(purge_hours);
            for item in self.db.items_published_before(&source.id, cutoff)? {
                if let Some(rel) = item.image_path.as_deref() {
                    let path = self.upload_dir.join(rel);
                    if let Err(err) = std::fs::remove_file(&path) {
                        warn!("Failed to remove {}: {}", path.display(), err);
                    }
                }
                self.db.delete_item(&item.id)?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!("Purged {} ephemeral item(s)", purged);
        }
        Ok(purged)
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Fetches one source now; returns how many new items were created.
    pub async fn fetch_source(&self, source: &ContentSource) -> Result<usize> {
        let created = match source.kind {
            SourceKind::Feed => self.fetch_feed(source).await?,
            SourceKind::Price => self.fetch_prices(source).await?,
            SourceKind::ManualText | SourceKind::ManualImage => 0,
        };
        self.db.touch_last_fetch(&source.id, Utc::now())?;
        if created > 0 {
            info!("Source {}: {} new item(s)", source.name, created);
        }
        Ok(created)
    }

    async fn fetch_feed(&self, source: &ContentSource) -> Result<usize> {
        let url = source
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Feed source {} has no url", source.name))?;
        let xml = self
            .http
            .get(url)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Feed request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Feed {} returned an error status", url))?
            .text()
            .await
            .context("Failed to read feed body")?;

        let mut created = 0;
        for entry in feed::parse_feed(&xml)? {
            let new = self.db.create_item(
                &source.id,
                NewItem {
                    content_type: Some(ContentType::Text),
                    title: Some(entry.title),
                    body: entry.summary,
                    source_url: entry.link,
                    external_id: Some(entry.guid),
                    published_at: entry.published_at,
                    ..Default::default()
                },
            )?;
            if new.is_some() {
                created += 1;
            }
        }
        Ok(created)
    }

    /// One item per symbol per hour; repeat fetches inside the hour
    /// refresh the stored quote in place.
    async fn fetch_prices(&self, source: &ContentSource) -> Result<usize> {
        let symbols = price::parse_symbols(source.url.as_deref());
        if symbols.is_empty() {
            anyhow::bail!("Price source {} lists no symbols", source.name);
        }

        let mut created = 0;
        for symbol in symbols {
            let quote = match price::fetch_quote(&self.http, &symbol).await {
                Ok(quote) => quote,
                Err(err) => {
                    warn!("Quote for {} failed: {:#}", symbol, err);
                    continue;
                }
            };
            let now = Utc::now();
            let external_id = price::hour_bucket_id(&symbol, now);
            let title = price::build_title(&symbol, quote);
            let body = price::build_body(&symbol, quote, now);

            match self.db.find_item_by_external_id(&source.id, &external_id)? {
                Some(existing) => {
                    self.db.update_price_item(
                        &existing.id,
                        &title,
                        &body,
                        quote.value,
                        quote.change_percent,
                    )?;
                }
                None => {
                    let new = self.db.create_item(
                        &source.id,
                        NewItem {
                            content_type: Some(ContentType::Price),
                            title: Some(title),
                            body: Some(body),
                            external_id: Some(external_id),
                            price_value: Some(quote.value),
                            price_change: Some(quote.change_percent),
                            published_at: Some(now),
                            ..Default::default()
                        },
                    )?;
                    if new.is_some() {
                        created += 1;
                    }
                }
            }
        }
        Ok(created)
    }

    /// Ingestion scheduler: scans enabled sources and fetches the ones
    /// whose interval has elapsed, then sweeps expiry. Runs until stopped.
    pub fn spawn_ingestion(
        self: &Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            info!("Ingestion scheduler started");
            loop {
                if let Err(err) = pool.ingestion_pass().await {
                    warn!("Ingestion pass failed: {:#}", err);
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(SCAN_INTERVAL_SECS)) => {}
                    _ = stop.changed() => {}
                }
                if *stop.borrow() {
                    break;
                }
            }
            info!("Ingestion scheduler stopped");
        })
    }

    async fn ingestion_pass(&self) -> Result<()> {
        let now = Utc::now();
        for source in self.db.list_enabled_sources()? {
            if matches!(source.kind, SourceKind::ManualText | SourceKind::ManualImage) {
                continue;
            }
            let due = match source.last_fetch_at {
                None => true,
                Some(last) => {
                    (now - last).num_seconds() >= source.fetch_interval_secs as i64
                }
            };
            if !due {
                continue;
            }
            if let Err(err) = self.fetch_source(&source).await {
                warn!("Fetch of source {} failed: {:#}", source.name, err);
            }
        }
        self.sweep_expired()?;
        Ok(())
    }

    /// Periodic maintenance: expiry sweep, ephemeral purge, pool stats log.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval_secs: u64,
        mut stop: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
                    _ = stop.changed() => {}
                }
                if *stop.borrow() {
                    break;
                }
                if let Err(err) = pool.sweep_expired() {
                    warn!("Expiry sweep failed: {:#}", err);
                }
                if let Err(err) = pool.purge_ephemeral() {
                    warn!("Ephemeral purge failed: {:#}", err);
                }
                match pool.stats() {
                    Ok(stats) => debug!(
                        "Pool: {}/{} live items across {} enabled source(s)",
                        stats.live_items, stats.total_items, stats.enabled_sources
                    ),
                    Err(err) => warn!("Pool stats failed: {:#}", err),
                }
            }
        })
    }
}
