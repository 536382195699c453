use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex_lite::Regex;

/// One syndication entry extracted from an RSS 2.0 or Atom document.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub title: String,
    pub summary: Option<String>,
    pub link: Option<String>,
    /// Stable dedupe key: the feed's guid/id, falling back to link or title.
    pub guid: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Parses either flavor of feed. Real-world feeds are messy, so this is a
/// tolerant tag scan rather than a strict XML parse: entries missing a
/// title are skipped, everything else is best-effort.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>> {
    let item_re =
        Regex::new(r"(?s)<item(?:\s[^>]*)?>.*?</item>").context("feed item pattern")?;
    let entry_re =
        Regex::new(r"(?s)<entry(?:\s[^>]*)?>.*?</entry>").context("feed entry pattern")?;

    let mut entries = Vec::new();
    for m in item_re.find_iter(xml) {
        if let Some(entry) = parse_rss_item(m.as_str()) {
            entries.push(entry);
        }
    }
    if entries.is_empty() {
        for m in entry_re.find_iter(xml) {
            if let Some(entry) = parse_atom_entry(m.as_str()) {
                entries.push(entry);
            }
        }
    }
    Ok(entries)
}

fn parse_rss_item(block: &str) -> Option<FeedEntry> {
    let title = tag_text(block, "title")?;
    let summary = tag_text(block, "description");
    let link = tag_text(block, "link");
    let guid = tag_text(block, "guid")
        .or_else(|| link.clone())
        .unwrap_or_else(|| title.clone());
    let published_at = tag_text(block, "pubDate").and_then(|raw| {
        DateTime::parse_from_rfc2822(raw.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    });
    Some(FeedEntry {
        title,
        summary,
        link,
        guid,
        published_at,
    })
}

fn parse_atom_entry(block: &str) -> Option<FeedEntry> {
    let title = tag_text(block, "title")?;
    let summary = tag_text(block, "summary").or_else(|| tag_text(block, "content"));
    let link = atom_link(block);
    let guid = tag_text(block, "id")
        .or_else(|| link.clone())
        .unwrap_or_else(|| title.clone());
    let published_at = tag_text(block, "published")
        .or_else(|| tag_text(block, "updated"))
        .and_then(|raw| {
            DateTime::parse_from_rfc3339(raw.trim())
                .ok()
                .map(|t| t.with_timezone(&Utc))
        });
    Some(FeedEntry {
        title,
        summary,
        link,
        guid,
        published_at,
    })
}

/// Inner text of the first `<tag>` in the block, CDATA unwrapped and
/// entities decoded. Empty text counts as absent.
fn tag_text(block: &str, tag: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?s)<{tag}[^>]*>(.*?)</{tag}>")).ok()?;
    let raw = re.captures(block)?.get(1)?.as_str();
    let text = unwrap_cdata(raw);
    let text = decode_entities(text.trim());
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Atom links live in the href attribute. Prefer rel="alternate", then any
/// link that carries no rel at all.
fn atom_link(block: &str) -> Option<String> {
    let re = Regex::new(r#"<link\b([^>]*)/?>"#).ok()?;
    let href_re = Regex::new(r#"href\s*=\s*"([^"]*)""#).ok()?;
    let rel_re = Regex::new(r#"rel\s*=\s*"([^"]*)""#).ok()?;

    let mut fallback = None;
    for caps in re.captures_iter(block) {
        let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let href = match href_re.captures(attrs).and_then(|c| c.get(1)) {
            Some(m) => m.as_str().to_string(),
            None => continue,
        };
        match rel_re.captures(attrs).and_then(|c| c.get(1)) {
            Some(rel) if rel.as_str() == "alternate" => return Some(href),
            Some(_) => {}
            None => fallback = fallback.or(Some(href)),
        }
    }
    fallback
}

fn unwrap_cdata(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("<![CDATA[")
        .and_then(|rest| rest.strip_suffix("]]>"))
        .unwrap_or(trimmed)
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
