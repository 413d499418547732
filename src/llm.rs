//! Chat-completion client for Azure OpenAI and OpenAI-compatible endpoints
//!
//! The same client also signs the speech endpoints (transcription and
//! synthesis), which live next to chat completions on both providers.

use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use crate::config::{LlmConfig, Provider};
use crate::error::{Error, Result};

/// Longest error body kept in `Error::Api`
const MAX_ERROR_BODY: usize = 512;

/// Chat message for conversation history
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull `choices[0].message.content` out of a completion body, trimmed
pub fn first_choice_content(body: &str) -> Result<String> {
    let response: ChatResponse = serde_json::from_str(body)?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or(Error::EmptyResponse("chat completion"))
}

/// HTTP client bound to one provider endpoint
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    provider: Provider,
    endpoint: String,
    api_key: String,
    api_version: String,
    deployment: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl ApiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            http,
            provider: config.provider,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
            deployment: config.deployment.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    /// Full URL of `path` (e.g. `chat/completions`) for a deployment
    pub fn url(&self, deployment: &str, path: &str) -> String {
        match self.provider {
            Provider::Azure => format!(
                "{}/openai/deployments/{}/{}?api-version={}",
                self.endpoint, deployment, path, self.api_version
            ),
            Provider::OpenAi => format!("{}/{}", self.endpoint, path),
        }
    }

    /// The `model` body field: OpenAI names the model, Azure encodes it in the URL
    pub fn model_field<'a>(&self, deployment: &'a str) -> Option<&'a str> {
        match self.provider {
            Provider::Azure => None,
            Provider::OpenAi => Some(deployment),
        }
    }

    /// Authenticated POST builder
    pub fn post(&self, deployment: &str, path: &str) -> RequestBuilder {
        let request = self.http.post(self.url(deployment, path));
        match self.provider {
            Provider::Azure => request.header("api-key", &self.api_key),
            Provider::OpenAi if self.api_key.is_empty() => request,
            Provider::OpenAi => request.bearer_auth(&self.api_key),
        }
    }

    /// Turn a non-success status into `Error::Api`
    pub async fn error_for_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(Error::Api {
            status: status.as_u16(),
            body,
        })
    }

    /// One chat-completion round trip, returning the trimmed first choice
    pub async fn chat(&self, messages: &[Message]) -> Result<String> {
        let request = ChatRequest {
            model: self.model_field(&self.deployment),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .post(&self.deployment, "chat/completions")
            .json(&request)
            .send()
            .await?;
        let body = Self::error_for_status(response).await?.text().await?;
        first_choice_content(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(provider: Provider, endpoint: &str) -> ApiClient {
        ApiClient::new(&LlmConfig {
            provider,
            endpoint: endpoint.into(),
            api_key: "k".into(),
            deployment: "gpt-4o".into(),
            ..LlmConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn azure_url_carries_deployment_and_version() {
        let c = client(Provider::Azure, "https://res.openai.azure.com/");
        assert_eq!(
            c.url("gpt-4o", "chat/completions"),
            "https://res.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-06-01"
        );
        assert_eq!(c.model_field("gpt-4o"), None);
    }

    #[test]
    fn openai_url_is_flat() {
        let c = client(Provider::OpenAi, "http://localhost:1234/v1");
        assert_eq!(
            c.url("gpt-4o", "audio/speech"),
            "http://localhost:1234/v1/audio/speech"
        );
        assert_eq!(c.model_field("tts-1"), Some("tts-1"));
    }

    #[test]
    fn new_rejects_missing_endpoint() {
        let result = ApiClient::new(&LlmConfig {
            endpoint: String::new(),
            deployment: "d".into(),
            ..LlmConfig::default()
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn request_omits_unset_fields() {
        let messages = [Message::system("be brief"), Message::user("hi")];
        let json = serde_json::to_value(ChatRequest {
            model: None,
            messages: &messages,
            max_tokens: Some(64),
            temperature: None,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"}
                ],
                "max_tokens": 64
            })
        );
    }

    #[test]
    fn first_choice_is_trimmed() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  fr \n"}},{"message":{"content":"de"}}]}"#;
        assert_eq!(first_choice_content(body).unwrap(), "fr");
    }

    #[test]
    fn missing_or_blank_content_is_empty_response() {
        for body in [
            r#"{"choices":[]}"#,
            r#"{}"#,
            r#"{"choices":[{"message":{"content":null}}]}"#,
            r#"{"choices":[{"message":{"content":"   "}}]}"#,
        ] {
            assert!(
                matches!(first_choice_content(body), Err(Error::EmptyResponse(_))),
                "{body}"
            );
        }
    }

    #[test]
    fn garbage_body_is_serialization_error() {
        assert!(matches!(
            first_choice_content("<html>"),
            Err(Error::Serialization(_))
        ));
    }
}
