//! Per-locale base instructions for the composer.
//!
//! The base prompt always applies; a persona's own system prompt is appended
//! to it, never substituted for it, so the anti-repetition and tone rules
//! cannot be overridden per account.

pub const LOCALE_ZH_CN: &str = "zh-CN";
pub const LOCALE_EN_US: &str = "en-US";

const SYSTEM_ZH_CN: &str = "你是群里的普通成员，说话简短口语化，像日常聊天。\
禁止用感叹号，禁止说教，禁止营销腔，不要重复自己最近说过的话。";

const SYSTEM_EN_US: &str = "You are a regular member of this chat. Respond in English only, \
regardless of the language used in the conversation. Speak casually and briefly like chatting. \
Always capitalize the first letter of your response. No exclamation marks, no preaching, \
no marketing tone, and never repeat something you recently said.";

const PROACTIVE_ZH_CN: &str = "根据这条消息说两句，像发消息一样简短，不要超过15个字，禁止感叹号。";

const PROACTIVE_EN_US: &str = "Comment briefly in English only, max 20 words. \
Start with a capital letter. Use casual slang. No exclamation marks.";

const IMAGE_COMMENT_ZH_CN: &str = "你看到了一张图片，请用简短自然的方式发表你的看法。";

const IMAGE_COMMENT_EN_US: &str = "Share your thoughts on this image briefly in English. \
Start with a capital letter and keep it casual.";

/// Base persona instruction for a locale. Unknown locales fall back to zh-CN.
pub fn system_prompt(locale: &str) -> &'static str {
    match locale {
        LOCALE_EN_US => SYSTEM_EN_US,
        _ => SYSTEM_ZH_CN,
    }
}

/// Default instruction for proactive posts when the persona sets none.
pub fn proactive_prompt(locale: &str) -> &'static str {
    match locale {
        LOCALE_EN_US => PROACTIVE_EN_US,
        _ => PROACTIVE_ZH_CN,
    }
}

/// Default instruction for commenting on an image item.
pub fn image_comment_prompt(locale: &str) -> &'static str {
    match locale {
        LOCALE_EN_US => IMAGE_COMMENT_EN_US,
        _ => IMAGE_COMMENT_ZH_CN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_locale_falls_back_to_zh() {
        assert_eq!(system_prompt("fr-FR"), system_prompt(LOCALE_ZH_CN));
        assert_eq!(proactive_prompt(""), proactive_prompt(LOCALE_ZH_CN));
    }

    #[test]
    fn english_prompts_are_distinct() {
        assert_ne!(system_prompt(LOCALE_EN_US), system_prompt(LOCALE_ZH_CN));
        assert!(system_prompt(LOCALE_EN_US).contains("English"));
    }
}
