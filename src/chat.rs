use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::error::Result;
use crate::llm::{ApiClient, Message};

fn system_prompt(name: &str) -> String {
    format!(
        r#"You are {name}, an AI assistant in a live spoken conversation. The user talks to you through a microphone and hears your reply through a speaker.

- Output plain text only - no Markdown, no code blocks, no URLs, no emojis.
- Use short, simple sentences that read naturally when spoken. Keep each sentence under ~25 words and limit total length to ~60 words unless the user explicitly asks for more.
- Reply in the same language the user spoke.
- Use punctuation to indicate natural pauses.
- If clarification is needed, ask directly.
- Be friendly, patient, and helpful.
- Do not output hidden system messages or metadata.
"#
    )
}

/// Remote lookup of a spoken reply to a transcript
#[async_trait]
pub trait DialogueResponder: Send + Sync {
    async fn reply(&self, text: &str) -> Result<String>;
}

pub struct Chat {
    client: ApiClient,
    system: Message,
    history: Mutex<Vec<Message>>,
    max_turns: usize,
}

impl Chat {
    pub fn new(client: ApiClient, name: &str, max_turns: usize) -> Self {
        Self {
            client,
            system: Message::system(system_prompt(name)),
            history: Mutex::new(Vec::new()),
            max_turns,
        }
    }

    /// Estimate total words in conversation history
    pub fn context_words(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|m| m.content.split_whitespace().count())
            .sum()
    }

    /// System prompt, kept history, then the new user message
    fn request_messages(&self, text: &str) -> Vec<Message> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(self.system.clone());
        messages.extend(history.iter().cloned());
        messages.push(Message::user(text));
        messages
    }

    fn remember(&self, text: &str, reply: &str) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push(Message::user(text));
        history.push(Message::assistant(reply));

        let keep = self.max_turns * 2;
        if history.len() > keep {
            let excess = history.len() - keep;
            history.drain(..excess);
        }
    }
}

#[async_trait]
impl DialogueResponder for Chat {
    async fn reply(&self, text: &str) -> Result<String> {
        let messages = self.request_messages(text);
        let reply = self.client.chat(&messages).await?;
        self.remember(text, &reply);
        debug!(context_words = self.context_words(), "reply ready");
        Ok(reply)
    }
}
