//! Language detection through a chat completion asking for a bare code

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::{ApiClient, Message};

const DETECT_PROMPT: &str = "Identify the language of the user's message. \
Reply with only its ISO 639-1 code (for example: en, fr, es, zh). \
No punctuation, no explanation.";

/// Remote lookup of the language a transcript is written in
#[async_trait]
pub trait LanguageDetector: Send + Sync {
    async fn detect_language(&self, text: &str) -> Result<String>;
}

/// Normalize a model answer into a language tag such as `en` or `pt-BR`
pub fn normalize_language_code(raw: &str) -> Option<String> {
    let token = raw
        .trim()
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '.' | ',' | ';' | ':'))
        .replace('_', "-");

    let mut parts = token.split('-');
    let primary = parts.next()?;
    if !(2..=3).contains(&primary.len()) || !primary.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }

    let mut code = primary.to_ascii_lowercase();
    for part in parts {
        if part.is_empty() || part.len() > 8 || !part.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        code.push('-');
        if part.len() == 2 {
            code.push_str(&part.to_ascii_uppercase());
        } else {
            code.push_str(part);
        }
    }
    Some(code)
}

pub struct ChatLanguageDetector {
    client: ApiClient,
    fallback: String,
}

impl ChatLanguageDetector {
    pub fn new(client: ApiClient, fallback: &str) -> Self {
        Self {
            client,
            fallback: fallback.to_string(),
        }
    }

    fn messages(text: &str) -> [Message; 2] {
        [Message::system(DETECT_PROMPT), Message::user(text)]
    }
}

#[async_trait]
impl LanguageDetector for ChatLanguageDetector {
    /// Transport and status failures are errors; an empty or unreadable
    /// answer resolves to the fallback code.
    async fn detect_language(&self, text: &str) -> Result<String> {
        let answer = match self.client.chat(&Self::messages(text)).await {
            Ok(answer) => answer,
            Err(Error::EmptyResponse(_)) | Err(Error::Serialization(_)) => {
                debug!("language detector gave no usable answer");
                return Ok(self.fallback.clone());
            }
            Err(e) => return Err(e),
        };

        Ok(normalize_language_code(&answer).unwrap_or_else(|| {
            debug!(answer = %answer, "unrecognized language code");
            self.fallback.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_codes_pass_through() {
        assert_eq!(normalize_language_code("en").as_deref(), Some("en"));
        assert_eq!(normalize_language_code(" FR\n").as_deref(), Some("fr"));
        assert_eq!(normalize_language_code("yue").as_deref(), Some("yue"));
    }

    #[test]
    fn regions_are_uppercased() {
        assert_eq!(normalize_language_code("pt-br").as_deref(), Some("pt-BR"));
        assert_eq!(normalize_language_code("en_US").as_deref(), Some("en-US"));
        assert_eq!(normalize_language_code("zh-Hans").as_deref(), Some("zh-Hans"));
    }

    #[test]
    fn decoration_is_stripped() {
        assert_eq!(normalize_language_code("\"es\".").as_deref(), Some("es"));
        assert_eq!(normalize_language_code("`de`").as_deref(), Some("de"));
        assert_eq!(normalize_language_code("it\nbecause...").as_deref(), Some("it"));
    }

    #[test]
    fn sentences_and_blanks_are_rejected() {
        assert_eq!(normalize_language_code(""), None);
        assert_eq!(normalize_language_code("   "), None);
        assert_eq!(normalize_language_code("English"), None);
        assert_eq!(normalize_language_code("e"), None);
        assert_eq!(normalize_language_code("12"), None);
        assert_eq!(normalize_language_code("en-"), None);
    }
}
