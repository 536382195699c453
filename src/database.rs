use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Operator-visible loop state for a persona.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersonaStatus {
    Offline,
    Online,
    Idle,
}

impl PersonaStatus {
    fn as_db_str(self) -> &'static str {
        match self {
            PersonaStatus::Offline => "offline",
            PersonaStatus::Online => "online",
            PersonaStatus::Idle => "idle",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "online" => PersonaStatus::Online,
            "idle" => PersonaStatus::Idle,
            _ => PersonaStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Feed,
    Price,
    ManualText,
    ManualImage,
}

impl SourceKind {
    fn as_db_str(self) -> &'static str {
        match self {
            SourceKind::Feed => "feed",
            SourceKind::Price => "price",
            SourceKind::ManualText => "manual_text",
            SourceKind::ManualImage => "manual_image",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "feed" => SourceKind::Feed,
            "price" => SourceKind::Price,
            "manual_image" => SourceKind::ManualImage,
            _ => SourceKind::ManualText,
        }
    }
}

/// How a source's items become outbound posts: forwarded verbatim, or
/// commented on by the persona's model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkMode {
    Forward,
    Comment,
}

impl WorkMode {
    fn as_db_str(self) -> &'static str {
        match self {
            WorkMode::Forward => "forward",
            WorkMode::Comment => "comment",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "comment" => WorkMode::Comment,
            _ => WorkMode::Forward,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Image,
    Price,
}

impl ContentType {
    fn as_db_str(self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Price => "price",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" => ContentType::Image,
            "price" => ContentType::Price,
            _ => ContentType::Text,
        }
    }
}

/// Full behavior configuration of one automated chat identity. Both loops
/// re-read this row at the top of every cycle, so operator edits apply
/// without a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub model: String,
    pub api_key: String,
    pub api_base_url: Option<String>,
    pub system_prompt: String,
    pub locale: String,
    pub target_channel: String,
    pub listen_interval_secs: u64,
    pub reply_interval_secs: u64,
    pub reply_probability: u32,
    pub buffer_size: usize,
    pub split_by_newline: bool,
    pub multi_msg_interval_secs: u64,
    pub enable_image_recognition: bool,
    pub proactive_enabled: bool,
    pub proactive_interval_min_secs: u64,
    pub proactive_interval_max_secs: u64,
    pub proactive_prompt: Option<String>,
    pub last_proactive_at: Option<DateTime<Utc>>,
    pub status: PersonaStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Persona {
    /// A persona with workable defaults; callers override what they need.
    pub fn new(name: &str, model: &str, target_channel: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            enabled: true,
            model: model.to_string(),
            api_key: String::new(),
            api_base_url: None,
            system_prompt: String::new(),
            locale: crate::prompts::LOCALE_ZH_CN.to_string(),
            target_channel: target_channel.to_string(),
            listen_interval_secs: 10,
            reply_interval_secs: 60,
            reply_probability: 50,
            buffer_size: 10,
            split_by_newline: false,
            multi_msg_interval_secs: 2,
            enable_image_recognition: false,
            proactive_enabled: false,
            proactive_interval_min_secs: 1800,
            proactive_interval_max_secs: 3600,
            proactive_prompt: None,
            last_proactive_at: None,
            status: PersonaStatus::Offline,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSource {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    pub url: Option<String>,
    pub fetch_interval_secs: u64,
    pub work_mode: WorkMode,
    /// Item may be sent by a different persona after one persona used it.
    pub reusable: bool,
    /// Item may be re-sent by the same persona; wins over `reusable`.
    pub allow_same_persona_reuse: bool,
    pub expire_hours: i64,
    /// Hard cleanup horizon for ephemeral items (record + backing file).
    pub purge_hours: Option<i64>,
    pub last_fetch_at: Option<DateTime<Utc>>,
}

impl ContentSource {
    pub fn new(name: &str, kind: SourceKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            enabled: true,
            kind,
            url: None,
            fetch_interval_secs: 1800,
            work_mode: WorkMode::Forward,
            reusable: false,
            allow_same_persona_reuse: false,
            expire_hours: 24,
            purge_hours: None,
            last_fetch_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub source_id: String,
    pub content_type: ContentType,
    pub title: Option<String>,
    pub body: Option<String>,
    /// Relative path under the upload dir for image items.
    pub image_path: Option<String>,
    pub source_url: Option<String>,
    pub external_id: Option<String>,
    pub price_value: Option<f64>,
    pub price_change: Option<f64>,
    pub published_at: DateTime<Utc>,
    pub expired: bool,
}

/// Fields for item creation; the id and expired flag are assigned here.
#[derive(Debug, Clone, Default)]
pub struct NewItem {
    pub content_type: Option<ContentType>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub image_path: Option<String>,
    pub source_url: Option<String>,
    pub external_id: Option<String>,
    pub price_value: Option<f64>,
    pub price_change: Option<f64>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub item_id: String,
    pub persona_id: String,
    pub sent_content: Option<String>,
    pub used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_sources: usize,
    pub enabled_sources: usize,
    pub total_items: usize,
    pub live_items: usize,
    pub used_items: usize,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_schema()?;
        Ok(db)
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS personas (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                model TEXT NOT NULL,
                api_key TEXT NOT NULL DEFAULT '',
                api_base_url TEXT,
                system_prompt TEXT NOT NULL DEFAULT '',
                locale TEXT NOT NULL DEFAULT 'zh-CN',
                target_channel TEXT NOT NULL DEFAULT '',
                listen_interval_secs INTEGER NOT NULL DEFAULT 10,
                reply_interval_secs INTEGER NOT NULL DEFAULT 60,
                reply_probability INTEGER NOT NULL DEFAULT 50,
                buffer_size INTEGER NOT NULL DEFAULT 10,
                split_by_newline INTEGER NOT NULL DEFAULT 0,
                multi_msg_interval_secs INTEGER NOT NULL DEFAULT 2,
                enable_image_recognition INTEGER NOT NULL DEFAULT 0,
                proactive_enabled INTEGER NOT NULL DEFAULT 0,
                proactive_interval_min_secs INTEGER NOT NULL DEFAULT 1800,
                proactive_interval_max_secs INTEGER NOT NULL DEFAULT 3600,
                proactive_prompt TEXT,
                last_proactive_at TEXT,
                status TEXT NOT NULL DEFAULT 'offline',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS content_sources (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                kind TEXT NOT NULL,
                url TEXT,
                fetch_interval_secs INTEGER NOT NULL DEFAULT 1800,
                work_mode TEXT NOT NULL DEFAULT 'forward',
                reusable INTEGER NOT NULL DEFAULT 0,
                allow_same_persona_reuse INTEGER NOT NULL DEFAULT 0,
                expire_hours INTEGER NOT NULL DEFAULT 24,
                purge_hours INTEGER,
                last_fetch_at TEXT
            );

            CREATE TABLE IF NOT EXISTS content_items (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL REFERENCES content_sources(id) ON DELETE CASCADE,
                content_type TEXT NOT NULL DEFAULT 'text',
                title TEXT,
                body TEXT,
                image_path TEXT,
                source_url TEXT,
                external_id TEXT,
                price_value REAL,
                price_change REAL,
                published_at TEXT NOT NULL,
                expired INTEGER NOT NULL DEFAULT 0,
                UNIQUE(source_id, external_id)
            );

            CREATE TABLE IF NOT EXISTS usage_records (
                item_id TEXT NOT NULL REFERENCES content_items(id) ON DELETE CASCADE,
                persona_id TEXT NOT NULL,
                sent_content TEXT,
                used_at TEXT NOT NULL,
                PRIMARY KEY (item_id, persona_id)
            );

            CREATE TABLE IF NOT EXISTS sent_messages (
                id TEXT PRIMARY KEY,
                persona_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_items_source_published
                ON content_items(source_id, published_at DESC);
            CREATE INDEX IF NOT EXISTS idx_sent_messages_persona
                ON sent_messages(persona_id, created_at DESC);
            ",
        )?;
        Ok(())
    }

    // ========================================================================
    // Personas
    // ========================================================================

    pub fn upsert_persona(&self, persona: &Persona) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO personas (
                id, name, enabled, model, api_key, api_base_url, system_prompt,
                locale, target_channel, listen_interval_secs, reply_interval_secs,
                reply_probability, buffer_size, split_by_newline,
                multi_msg_interval_secs, enable_image_recognition,
                proactive_enabled, proactive_interval_min_secs,
                proactive_interval_max_secs, proactive_prompt, last_proactive_at,
                status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                enabled = excluded.enabled,
                model = excluded.model,
                api_key = excluded.api_key,
                api_base_url = excluded.api_base_url,
                system_prompt = excluded.system_prompt,
                locale = excluded.locale,
                target_channel = excluded.target_channel,
                listen_interval_secs = excluded.listen_interval_secs,
                reply_interval_secs = excluded.reply_interval_secs,
                reply_probability = excluded.reply_probability,
                buffer_size = excluded.buffer_size,
                split_by_newline = excluded.split_by_newline,
                multi_msg_interval_secs = excluded.multi_msg_interval_secs,
                enable_image_recognition = excluded.enable_image_recognition,
                proactive_enabled = excluded.proactive_enabled,
                proactive_interval_min_secs = excluded.proactive_interval_min_secs,
                proactive_interval_max_secs = excluded.proactive_interval_max_secs,
                proactive_prompt = excluded.proactive_prompt,
                last_proactive_at = excluded.last_proactive_at,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                persona.id,
                persona.name,
                persona.enabled,
                persona.model,
                persona.api_key,
                persona.api_base_url,
                persona.system_prompt,
                persona.locale,
                persona.target_channel,
                persona.listen_interval_secs as i64,
                persona.reply_interval_secs as i64,
                persona.reply_probability as i64,
                persona.buffer_size as i64,
                persona.split_by_newline,
                persona.multi_msg_interval_secs as i64,
                persona.enable_image_recognition,
                persona.proactive_enabled,
                persona.proactive_interval_min_secs as i64,
                persona.proactive_interval_max_secs as i64,
                persona.proactive_prompt,
                persona.last_proactive_at.map(|t| t.to_rfc3339()),
                persona.status.as_db_str(),
                persona.created_at.to_rfc3339(),
                persona.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_persona(&self, id: &str) -> Result<Option<Persona>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT * FROM personas WHERE id = ?1",
            params![id],
            row_to_persona,
        )
        .optional()
        .context("Failed to load persona")
    }

    pub fn list_enabled_personas(&self) -> Result<Vec<Persona>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT * FROM personas WHERE enabled = 1 ORDER BY name")?;
        let personas = stmt
            .query_map([], row_to_persona)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(personas)
    }

    pub fn set_persona_status(&self, id: &str, status: PersonaStatus) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE personas SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_db_str(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn touch_last_proactive(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE personas SET last_proactive_at = ?1, updated_at = ?2 WHERE id = ?3",
            params![at.to_rfc3339(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Removes a persona. Operator-layer call; running loops notice the
    /// missing row on their next cycle and wind down.
    pub fn delete_persona(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM personas WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ========================================================================
    // Content sources
    // ========================================================================

    pub fn upsert_source(&self, source: &ContentSource) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO content_sources (
                id, name, enabled, kind, url, fetch_interval_secs, work_mode,
                reusable, allow_same_persona_reuse, expire_hours, purge_hours,
                last_fetch_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                enabled = excluded.enabled,
                kind = excluded.kind,
                url = excluded.url,
                fetch_interval_secs = excluded.fetch_interval_secs,
                work_mode = excluded.work_mode,
                reusable = excluded.reusable,
                allow_same_persona_reuse = excluded.allow_same_persona_reuse,
                expire_hours = excluded.expire_hours,
                purge_hours = excluded.purge_hours,
                last_fetch_at = excluded.last_fetch_at",
            params![
                source.id,
                source.name,
                source.enabled,
                source.kind.as_db_str(),
                source.url,
                source.fetch_interval_secs as i64,
                source.work_mode.as_db_str(),
                source.reusable,
                source.allow_same_persona_reuse,
                source.expire_hours,
                source.purge_hours,
                source.last_fetch_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_source(&self, id: &str) -> Result<Option<ContentSource>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT * FROM content_sources WHERE id = ?1",
            params![id],
            row_to_source,
        )
        .optional()
        .context("Failed to load content source")
    }

    pub fn list_enabled_sources(&self) -> Result<Vec<ContentSource>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM content_sources WHERE enabled = 1 ORDER BY name")?;
        let sources = stmt
            .query_map([], row_to_source)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    pub fn list_sources(&self) -> Result<Vec<ContentSource>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT * FROM content_sources ORDER BY name")?;
        let sources = stmt
            .query_map([], row_to_source)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    pub fn touch_last_fetch(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE content_sources SET last_fetch_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Removes the source, its items and their usage records (cascade).
    pub fn delete_source(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM content_sources WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ========================================================================
    // Content items
    // ========================================================================

    /// Creates an item; idempotent on (source, external id). Returns the new
    /// item id, or None when an item with the same external id already
    /// exists for the source.
    pub fn create_item(&self, source_id: &str, item: NewItem) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let id = Uuid::new_v4().to_string();
        let published = item.published_at.unwrap_or_else(Utc::now);
        let changed = conn.execute(
            "INSERT OR IGNORE INTO content_items (
                id, source_id, content_type, title, body, image_path,
                source_url, external_id, price_value, price_change,
                published_at, expired
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)",
            params![
                id,
                source_id,
                item.content_type.unwrap_or(ContentType::Text).as_db_str(),
                item.title,
                item.body,
                item.image_path,
                item.source_url,
                item.external_id,
                item.price_value,
                item.price_change,
                published.to_rfc3339(),
            ],
        )?;
        Ok(if changed > 0 { Some(id) } else { None })
    }

    pub fn get_item(&self, id: &str) -> Result<Option<ContentItem>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT * FROM content_items WHERE id = ?1",
            params![id],
            row_to_item,
        )
        .optional()
        .context("Failed to load content item")
    }

    pub fn find_item_by_external_id(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<ContentItem>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT * FROM content_items WHERE source_id = ?1 AND external_id = ?2",
            params![source_id, external_id],
            row_to_item,
        )
        .optional()
        .context("Failed to look up item by external id")
    }

    /// Refresh mutable fields of a price item in place (same hour bucket).
    pub fn update_price_item(
        &self,
        item_id: &str,
        title: &str,
        body: &str,
        price_value: f64,
        price_change: f64,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE content_items
             SET title = ?1, body = ?2, price_value = ?3, price_change = ?4
             WHERE id = ?5",
            params![title, body, price_value, price_change, item_id],
        )?;
        Ok(())
    }

    pub fn count_live_items(&self, source_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM content_items WHERE source_id = ?1 AND expired = 0",
            params![source_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Up to `limit` live items for the source, newest first, excluding the
    /// given ids.
    pub fn recent_eligible_items(
        &self,
        source_id: &str,
        exclude: &[String],
        limit: usize,
    ) -> Result<Vec<ContentItem>> {
        let conn = self.lock_conn()?;
        let placeholders = exclude
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if exclude.is_empty() {
            format!(
                "SELECT * FROM content_items WHERE source_id = ?1 AND expired = 0
                 ORDER BY published_at DESC LIMIT {limit}"
            )
        } else {
            format!(
                "SELECT * FROM content_items
                 WHERE source_id = ?1 AND expired = 0 AND id NOT IN ({placeholders})
                 ORDER BY published_at DESC LIMIT {limit}"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&source_id];
        for id in exclude {
            bound.push(id);
        }
        let items = stmt
            .query_map(bound.as_slice(), row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Item ids from this source the given persona has already used.
    pub fn used_item_ids_for_persona(
        &self,
        source_id: &str,
        persona_id: &str,
    ) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT u.item_id FROM usage_records u
             JOIN content_items i ON i.id = u.item_id
             WHERE i.source_id = ?1 AND u.persona_id = ?2",
        )?;
        let ids = stmt
            .query_map(params![source_id, persona_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Item ids from this source any persona has used.
    pub fn used_item_ids_any(&self, source_id: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT u.item_id FROM usage_records u
             JOIN content_items i ON i.id = u.item_id
             WHERE i.source_id = ?1",
        )?;
        let ids = stmt
            .query_map(params![source_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Flags items published before the cutoff as expired. Usage history is
    /// retained; nothing is deleted. Returns how many rows changed.
    pub fn mark_expired_before(&self, source_id: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE content_items SET expired = 1
             WHERE source_id = ?1 AND expired = 0 AND published_at < ?2",
            params![source_id, cutoff.to_rfc3339()],
        )?;
        Ok(changed)
    }

    /// Items from this source published before the cutoff, for hard purge.
    pub fn items_published_before(
        &self,
        source_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ContentItem>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM content_items WHERE source_id = ?1 AND published_at < ?2",
        )?;
        let items = stmt
            .query_map(params![source_id, cutoff.to_rfc3339()], row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Hard-deletes an item (usage records cascade). Only for ephemeral
    /// sources with a purge horizon; normal expiry flags instead.
    pub fn delete_item(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM content_items WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ========================================================================
    // Usage records
    // ========================================================================

    /// At most one usage record per (item, persona); repeat use refreshes
    /// the timestamp and sent content.
    pub fn upsert_usage(
        &self,
        item_id: &str,
        persona_id: &str,
        sent_content: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO usage_records (item_id, persona_id, sent_content, used_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(item_id, persona_id) DO UPDATE SET
                sent_content = excluded.sent_content,
                used_at = excluded.used_at",
            params![item_id, persona_id, sent_content, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_usage(&self, item_id: &str, persona_id: &str) -> Result<Option<UsageRecord>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT item_id, persona_id, sent_content, used_at FROM usage_records
             WHERE item_id = ?1 AND persona_id = ?2",
            params![item_id, persona_id],
            |row| {
                Ok(UsageRecord {
                    item_id: row.get(0)?,
                    persona_id: row.get(1)?,
                    sent_content: row.get(2)?,
                    used_at: parse_ts_col(row, 3)?,
                })
            },
        )
        .optional()
        .context("Failed to load usage record")
    }

    pub fn usage_count_for_item(&self, item_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM usage_records WHERE item_id = ?1",
            params![item_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // Sent message history
    // ========================================================================

    pub fn record_sent_message(&self, persona_id: &str, content: &str) -> Result<String> {
        let conn = self.lock_conn()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO sent_messages (id, persona_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, persona_id, content, Utc::now().to_rfc3339()],
        )?;
        Ok(id)
    }

    pub fn recent_sent_messages(&self, persona_id: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT content FROM sent_messages WHERE persona_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let messages = stmt
            .query_map(params![persona_id, limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(messages)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn pool_stats(&self) -> Result<PoolStats> {
        let conn = self.lock_conn()?;
        let total_sources: i64 =
            conn.query_row("SELECT COUNT(*) FROM content_sources", [], |r| r.get(0))?;
        let enabled_sources: i64 = conn.query_row(
            "SELECT COUNT(*) FROM content_sources WHERE enabled = 1",
            [],
            |r| r.get(0),
        )?;
        let total_items: i64 =
            conn.query_row("SELECT COUNT(*) FROM content_items", [], |r| r.get(0))?;
        let live_items: i64 = conn.query_row(
            "SELECT COUNT(*) FROM content_items WHERE expired = 0",
            [],
            |r| r.get(0),
        )?;
        let used_items: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT item_id) FROM usage_records",
            [],
            |r| r.get(0),
        )?;
        Ok(PoolStats {
            total_sources: total_sources as usize,
            enabled_sources: enabled_sources as usize,
            total_items: total_items as usize,
            live_items: live_items as usize,
            used_items: used_items as usize,
        })
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(row.get::<_, String>(idx)?)
}

fn parse_opt_ts(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}

fn row_to_persona(row: &Row<'_>) -> rusqlite::Result<Persona> {
    Ok(Persona {
        id: row.get("id")?,
        name: row.get("name")?,
        enabled: row.get("enabled")?,
        model: row.get("model")?,
        api_key: row.get("api_key")?,
        api_base_url: row.get("api_base_url")?,
        system_prompt: row.get("system_prompt")?,
        locale: row.get("locale")?,
        target_channel: row.get("target_channel")?,
        listen_interval_secs: row.get::<_, i64>("listen_interval_secs")? as u64,
        reply_interval_secs: row.get::<_, i64>("reply_interval_secs")? as u64,
        reply_probability: row.get::<_, i64>("reply_probability")? as u32,
        buffer_size: row.get::<_, i64>("buffer_size")? as usize,
        split_by_newline: row.get("split_by_newline")?,
        multi_msg_interval_secs: row.get::<_, i64>("multi_msg_interval_secs")? as u64,
        enable_image_recognition: row.get("enable_image_recognition")?,
        proactive_enabled: row.get("proactive_enabled")?,
        proactive_interval_min_secs: row.get::<_, i64>("proactive_interval_min_secs")? as u64,
        proactive_interval_max_secs: row.get::<_, i64>("proactive_interval_max_secs")? as u64,
        proactive_prompt: row.get("proactive_prompt")?,
        last_proactive_at: parse_opt_ts(row.get("last_proactive_at")?)?,
        status: PersonaStatus::from_db(&row.get::<_, String>("status")?),
        created_at: parse_ts(row.get("created_at")?)?,
        updated_at: parse_ts(row.get("updated_at")?)?,
    })
}

fn row_to_source(row: &Row<'_>) -> rusqlite::Result<ContentSource> {
    Ok(ContentSource {
        id: row.get("id")?,
        name: row.get("name")?,
        enabled: row.get("enabled")?,
        kind: SourceKind::from_db(&row.get::<_, String>("kind")?),
        url: row.get("url")?,
        fetch_interval_secs: row.get::<_, i64>("fetch_interval_secs")? as u64,
        work_mode: WorkMode::from_db(&row.get::<_, String>("work_mode")?),
        reusable: row.get("reusable")?,
        allow_same_persona_reuse: row.get("allow_same_persona_reuse")?,
        expire_hours: row.get("expire_hours")?,
        purge_hours: row.get("purge_hours")?,
        last_fetch_at: parse_opt_ts(row.get("last_fetch_at")?)?,
    })
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<ContentItem> {
    Ok(ContentItem {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        content_type: ContentType::from_db(&row.get::<_, String>("content_type")?),
        title: row.get("title")?,
        body: row.get("body")?,
        image_path: row.get("image_path")?,
        source_url: row.get("source_url")?,
        external_id: row.get("external_id")?,
        price_value: row.get("price_value")?,
        price_change: row.get("price_change")?,
        published_at: parse_ts(row.get("published_at")?)?,
        expired: row.get("expired")?,
    })
}
