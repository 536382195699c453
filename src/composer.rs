use anyhow::Result;
use async_trait::async_trait;

use crate::database::Persona;
use crate::llm::{ApiMessage, ContentPart, ImageUrl, LlmClient, MessageContent, Sampling};
use crate::prompts;

/// One transcript entry handed to the model, oldest first.
#[derive(Debug, Clone)]
pub struct ContextMessage {
    pub from_self: bool,
    pub text: String,
    /// Base64 data URL, present when the surface captured an attached image.
    pub image: Option<String>,
}

/// Seam between the loops and the model so cycle logic is testable
/// without network access.
#[async_trait]
pub trait Composer: Send + Sync {
    /// Produce one outbound message for the persona. `context` is the
    /// recent transcript (may be empty for proactive posts), `instruction`
    /// an extra task line appended after the transcript.
    async fn compose(
        &self,
        persona: &Persona,
        context: &[ContextMessage],
        instruction: Option<&str>,
    ) -> Result<String>;
}

/// Production composer backed by an OpenAI-compatible chat completion API.
pub struct ReplyComposer;

#[async_trait]
impl Composer for ReplyComposer {
    async fn compose(
        &self,
        persona: &Persona,
        context: &[ContextMessage],
        instruction: Option<&str>,
    ) -> Result<String> {
        let client = LlmClient::new(
            persona.api_key.clone(),
            persona.model.clone(),
            persona.api_base_url.clone(),
        );
        let messages = build_messages(persona, context, instruction);
        let reply = client.generate(messages, Sampling::default()).await?;
        Ok(reply.trim().to_string())
    }
}

/// Merged role prompt: the locale's base behavior rules, then the
/// persona's own character prompt.
pub fn build_system_prompt(persona: &Persona) -> String {
    let base = prompts::system_prompt(&persona.locale);
    if persona.system_prompt.trim().is_empty() {
        base.to_string()
    } else {
        format!("{}\n\n{}", base, persona.system_prompt.trim())
    }
}

/// Numbered transcript, oldest to newest, with the persona's own lines
/// tagged so the model keeps track of who said what.
pub fn build_transcript(context: &[ContextMessage]) -> String {
    context
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            let who = if msg.from_self { "self" } else { "other" };
            format!("[{}] {}: {}", i + 1, who, msg.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// At most one image is attached per request: the newest one in the
/// transcript, and only when the persona has image recognition on.
pub fn pick_latest_image<'a>(persona: &Persona, context: &'a [ContextMessage]) -> Option<&'a str> {
    if !persona.enable_image_recognition {
        return None;
    }
    context
        .iter()
        .rev()
        .find_map(|msg| msg.image.as_deref())
}

fn build_messages(
    persona: &Persona,
    context: &[ContextMessage],
    instruction: Option<&str>,
) -> Vec<ApiMessage> {
    let mut user_text = String::new();
    if !context.is_empty() {
        user_text.push_str(&build_transcript(context));
        user_text.push('\n');
        user_text.push_str(match persona.locale.as_str() {
            prompts::LOCALE_EN_US => {
                "Reply only to the newest message that is not your own, in character."
            }
            _ => "只回复最新一条不是你自己发出的消息，保持角色。",
        });
    }
    if let Some(extra) = instruction {
        if !user_text.is_empty() {
            user_text.push_str("\n\n");
        }
        user_text.push_str(extra);
    }

    let user_content = match pick_latest_image(persona, context) {
        Some(image) => MessageContent::Parts(vec![
            ContentPart::Text { text: user_text },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image.to_string(),
                },
            },
        ]),
        None => MessageContent::Text(user_text),
    };

    vec![
        ApiMessage {
            role: "system".to_string(),
            content: MessageContent::Text(build_system_prompt(persona)),
        },
        ApiMessage {
            role: "user".to_string(),
            content: user_content,
        },
    ]
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted composer: returns canned replies in order and records every
    /// call's instruction for assertions.
    pub struct StubComposer {
        replies: Mutex<Vec<String>>,
        pub calls: Mutex<Vec<Option<String>>>,
        fail: bool,
    }

    impl StubComposer {
        pub fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                calls: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                replies: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Composer for StubComposer {
        async fn compose(
            &self,
            _persona: &Persona,
            _context: &[ContextMessage],
            instruction: Option<&str>,
        ) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push(instruction.map(|s| s.to_string()));
            if self.fail {
                anyhow::bail!("model unavailable");
            }
            let mut replies = self.replies.lock().unwrap();
            replies
                .pop()
                .ok_or_else(|| anyhow::anyhow!("stub out of replies"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona(locale: &str) -> Persona {
        let mut p = Persona::new("sam", "gpt-4o-mini", "group-42");
        p.locale = locale.to_string();
        p
    }

    #[test]
    fn system_prompt_merges_locale_base_with_character() {
        let mut p = persona("en-US");
        p.system_prompt = "You are a sardonic barista.".to_string();
        let merged = build_system_prompt(&p);
        assert!(merged.starts_with(prompts::system_prompt("en-US")));
        assert!(merged.ends_with("You are a sardonic barista."));
    }

    #[test]
    fn blank_character_prompt_uses_base_alone() {
        let mut p = persona("zh-CN");
        p.system_prompt = "   ".to_string();
        assert_eq!(build_system_prompt(&p), prompts::system_prompt("zh-CN"));
    }

    #[test]
    fn transcript_is_numbered_oldest_first_with_self_tags() {
        let context = vec![
            ContextMessage {
                from_self: false,
                text: "hello".to_string(),
                image: None,
            },
            ContextMessage {
                from_self: true,
                text: "hi there".to_string(),
                image: None,
            },
        ];
        let transcript = build_transcript(&context);
        assert_eq!(transcript, "[1] other: hello\n[2] self: hi there");
    }

    #[test]
    fn latest_image_only_when_recognition_enabled() {
        let context = vec![
            ContextMessage {
                from_self: false,
                text: "old pic".to_string(),
                image: Some("data:image/png;base64,OLD".to_string()),
            },
            ContextMessage {
                from_self: false,
                text: "new pic".to_string(),
                image: Some("data:image/png;base64,NEW".to_string()),
            },
        ];

        let mut p = persona("en-US");
        assert!(pick_latest_image(&p, &context).is_none());

        p.enable_image_recognition = true;
        assert_eq!(
            pick_latest_image(&p, &context),
            Some("data:image/png;base64,NEW")
        );
    }

    #[test]
    fn image_request_uses_multipart_user_content() {
        let mut p = persona("en-US");
        p.enable_image_recognition = true;
        let context = vec![ContextMessage {
            from_self: false,
            text: "what is this".to_string(),
            image: Some("data:image/jpeg;base64,AAAA".to_string()),
        }];
        let messages = build_messages(&p, &context, None);
        assert_eq!(messages.len(), 2);
        match &messages[1].content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            MessageContent::Text(_) => panic!("expected multipart content"),
        }
    }
}
