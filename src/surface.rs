//! Chat surface capability boundary.
//!
//! The concrete automation that reaches the messaging platform lives outside
//! this crate; loops only see this trait. Surface implementations are
//! expected to be flaky (disconnects, layout drift, login expiry), so every
//! method is fallible and callers treat errors as per-cycle events.

use anyhow::Result;
use async_trait::async_trait;

/// One message observed on the chat surface during a poll.
#[derive(Debug, Clone)]
pub struct ObservedMessage {
    /// Stable identifier used for newest-incoming dedupe.
    pub id: String,
    pub text: String,
    /// Base64 data URLs of any attached images.
    pub images: Vec<String>,
    /// Whether the surface attributed this message to the persona itself.
    pub from_self: bool,
}

#[async_trait]
pub trait ChatSurface: Send + Sync {
    async fn is_connected(&self) -> bool;

    /// The most recent messages in the bound channel, oldest first.
    async fn read_recent(&self, limit: usize) -> Result<Vec<ObservedMessage>>;

    async fn send_text(&self, text: &str) -> Result<()>;

    /// `image` is a base64 data URL; the caption is optional.
    async fn send_image(&self, image: &str, caption: Option<&str>) -> Result<()>;

    /// Re-navigate to the target channel after a disconnect. Returns whether
    /// the surface believes it is back in the channel.
    async fn reconnect(&self, target_channel: &str) -> Result<bool>;
}

/// Raw attribution signals a surface implementation can extract for one
/// message before it decides `from_self`. Fields are best-effort; absent
/// signals are `false`/`None`.
#[derive(Debug, Clone, Default)]
pub struct RawSurfaceMessage {
    pub text: String,
    /// The surface's explicit outgoing marker (class, attribute, API flag).
    pub outgoing_flag: bool,
    /// Author handle when the surface exposes one.
    pub author: Option<String>,
    /// Layout hint: the message renders on the "own messages" side.
    pub own_side_hint: bool,
}

/// Ranked own-message detection. Surface implementations call this so the
/// agent core never reasons about surface-specific markers. First matching
/// signal wins:
/// 1. the surface's explicit outgoing flag,
/// 2. the author handle matching the persona's own handle,
/// 3. the layout alignment hint,
/// 4. the text matching something this persona recently sent.
pub fn is_own_message(
    raw: &RawSurfaceMessage,
    own_handle: Option<&str>,
    recent_sent: &[String],
) -> bool {
    if raw.outgoing_flag {
        return true;
    }
    if let (Some(author), Some(own)) = (raw.author.as_deref(), own_handle) {
        if !own.is_empty() && author.eq_ignore_ascii_case(own) {
            return true;
        }
    }
    if raw.own_side_hint {
        return true;
    }
    // Scraped text may carry a trailing bubble timestamp; strip it before
    // comparing against what the persona actually sent.
    let normalized = normalize_text(&strip_trailing_timestamp(&raw.text));
    if !normalized.is_empty() {
        return recent_sent
            .iter()
            .any(|sent| normalize_text(sent) == normalized);
    }
    false
}

/// Trailing timestamp fragments (e.g. "13:49" under a bubble) leak into
/// scraped message text on some surfaces; strip them before use.
pub fn strip_trailing_timestamp(text: &str) -> String {
    let mut out = text.trim().to_string();
    if let Ok(re) = regex_lite::Regex::new(r"(\d{1,2}:\d{2}\s*)+$") {
        out = re.replace(&out, "").trim().to_string();
    }
    if let Ok(ws) = regex_lite::Regex::new(r"\s+") {
        out = ws.replace_all(&out, " ").into_owned();
    }
    out
}

/// Lowercased, whitespace-trimmed form used for content comparisons.
pub fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum SentRecord {
        Text(String),
        Image { caption: Option<String> },
    }

    /// Surface double that replays scripted read batches, one per
    /// `read_recent` call, repeating the final batch once exhausted.
    pub struct ScriptedSurface {
        connected: AtomicBool,
        reconnect_succeeds: bool,
        batches: Mutex<Vec<Vec<ObservedMessage>>>,
        cursor: AtomicUsize,
        pub sent: Mutex<Vec<SentRecord>>,
        reconnects: AtomicUsize,
    }

    impl ScriptedSurface {
        pub fn new(batches: Vec<Vec<ObservedMessage>>) -> Self {
            Self {
                connected: AtomicBool::new(true),
                reconnect_succeeds: true,
                batches: Mutex::new(batches),
                cursor: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                reconnects: AtomicUsize::new(0),
            }
        }

        pub fn disconnected(mut self) -> Self {
            self.connected = AtomicBool::new(false);
            self
        }

        pub fn failing_reconnect(mut self) -> Self {
            self.reconnect_succeeds = false;
            self
        }

        pub fn reconnect_calls(&self) -> usize {
            self.reconnects.load(Ordering::SeqCst)
        }

        pub fn sent_texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|r| match r {
                    SentRecord::Text(t) => Some(t.clone()),
                    SentRecord::Image { .. } => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ChatSurface for ScriptedSurface {
        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn read_recent(&self, limit: usize) -> Result<Vec<ObservedMessage>> {
            let batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                return Ok(Vec::new());
            }
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
            let batch = batches.get(idx).unwrap_or_else(|| {
                batches.last().expect("batches checked non-empty")
            });
            let start = batch.len().saturating_sub(limit);
            Ok(batch[start..].to_vec())
        }

        async fn send_text(&self, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push(SentRecord::Text(text.to_string()));
            Ok(())
        }

        async fn send_image(&self, _image: &str, caption: Option<&str>) -> Result<()> {
            self.sent.lock().unwrap().push(SentRecord::Image {
                caption: caption.map(str::to_string),
            });
            Ok(())
        }

        async fn reconnect(&self, _target_channel: &str) -> Result<bool> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            if self.reconnect_succeeds {
                self.connected.store(true, Ordering::SeqCst);
            }
            Ok(self.reconnect_succeeds)
        }
    }

    pub fn msg(id: &str, text: &str, from_self: bool) -> ObservedMessage {
        ObservedMessage {
            id: id.to_string(),
            text: text.to_string(),
            images: Vec::new(),
            from_self,
        }
    }
}
