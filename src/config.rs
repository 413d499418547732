use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub gesture: GestureConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            llm: LlmConfig::default(),
            speech: SpeechConfig::default(),
            turn: TurnConfig::default(),
            gesture: GestureConfig::default(),
        }
    }
}

fn default_name() -> String {
    "Handy".into()
}

// ============================================================================
// LLM Config
// ============================================================================

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Azure OpenAI: deployment in the URL, `api-key` header
    #[default]
    Azure,
    /// OpenAI-compatible: model in the body, bearer token
    OpenAi,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: Provider,
    /// Base URL (supports ${ENV_VAR} syntax)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// API key (supports ${ENV_VAR} syntax)
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// Deployment name (Azure) or model name (OpenAI)
    #[serde(default = "default_deployment")]
    pub deployment: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Exchanges kept as dialogue context
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            endpoint: default_endpoint(),
            api_key: default_api_key(),
            deployment: default_deployment(),
            api_version: default_api_version(),
            timeout_secs: default_timeout_secs(),
            max_tokens: None,
            temperature: None,
            history_turns: default_history_turns(),
        }
    }
}

fn default_endpoint() -> String {
    "${AZURE_OPENAI_ENDPOINT}".into()
}
fn default_api_key() -> String {
    "${AZURE_OPENAI_API_KEY}".into()
}
fn default_deployment() -> String {
    "${AZURE_OPENAI_DEPLOYMENT}".into()
}
fn default_api_version() -> String {
    "2024-06-01".into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_history_turns() -> usize {
    6
}

impl LlmConfig {
    /// Expand env vars and fill the OpenAI endpoint when left empty
    pub fn resolve(&mut self) {
        self.endpoint = expand_env_vars(&self.endpoint);
        self.api_key = expand_env_vars(&self.api_key);
        self.deployment = expand_env_vars(&self.deployment);

        if self.endpoint.is_empty() && self.provider == Provider::OpenAi {
            self.endpoint = "https://api.openai.com/v1".to_string();
        }
        while self.endpoint.ends_with('/') {
            self.endpoint.pop();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(Error::Config(
                "llm.endpoint is empty (set AZURE_OPENAI_ENDPOINT or llm.endpoint)".into(),
            ));
        }
        if self.deployment.is_empty() {
            return Err(Error::Config(
                "llm.deployment is empty (set AZURE_OPENAI_DEPLOYMENT or llm.deployment)".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ============================================================================
// Speech Config
// ============================================================================

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Typed lines on stdin stand in for finalized transcripts
    #[default]
    Console,
    /// Default input device, remote transcription
    Microphone,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackBackend {
    /// Print the reply and hold for its spoken duration
    #[default]
    Console,
    /// Remote synthesis, local output device
    Remote,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpeechConfig {
    #[serde(default)]
    pub capture: CaptureBackend,
    #[serde(default)]
    pub playback: PlaybackBackend,
    #[serde(default = "default_stt_deployment")]
    pub stt_deployment: String,
    #[serde(default = "default_tts_deployment")]
    pub tts_deployment: String,
    #[serde(default = "default_voice")]
    pub default_voice: String,
    /// Language code -> voice name
    #[serde(default)]
    pub voices: HashMap<String, String>,
    /// Console playback pacing
    #[serde(default = "default_words_per_minute")]
    pub words_per_minute: u32,
    /// RMS level that starts an utterance
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f32,
    #[serde(default = "default_silence_ms")]
    pub silence_ms: u32,
    #[serde(default = "default_max_segment_secs")]
    pub max_segment_secs: u32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            capture: CaptureBackend::default(),
            playback: PlaybackBackend::default(),
            stt_deployment: default_stt_deployment(),
            tts_deployment: default_tts_deployment(),
            default_voice: default_voice(),
            voices: HashMap::new(),
            words_per_minute: default_words_per_minute(),
            energy_threshold: default_energy_threshold(),
            silence_ms: default_silence_ms(),
            max_segment_secs: default_max_segment_secs(),
        }
    }
}

impl SpeechConfig {
    /// Voice for a language code, trying the primary subtag before the default
    pub fn voice_for(&self, language: &str) -> &str {
        let language = language.to_lowercase();
        let primary = language.split('-').next().unwrap_or_default();
        self.voices
            .get(&language)
            .or_else(|| self.voices.get(primary))
            .map(String::as_str)
            .unwrap_or(&self.default_voice)
    }
}

fn default_stt_deployment() -> String {
    "whisper".into()
}
fn default_tts_deployment() -> String {
    "tts".into()
}
fn default_voice() -> String {
    "alloy".into()
}
fn default_words_per_minute() -> u32 {
    170
}
fn default_energy_threshold() -> f32 {
    0.01
}
fn default_silence_ms() -> u32 {
    700
}
fn default_max_segment_secs() -> u32 {
    15
}

// ============================================================================
// Turn Config
// ============================================================================

#[derive(Debug, Deserialize, Clone)]
pub struct TurnConfig {
    /// Used when language detection fails
    #[serde(default = "default_language")]
    pub default_language: String,
    /// Quiet period after playback before capture resumes
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Playback is treated as ended after this long
    #[serde(default = "default_playback_timeout_secs")]
    pub playback_timeout_secs: u64,
    #[serde(default)]
    pub capture_restart: RestartConfig,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            default_language: default_language(),
            cooldown_ms: default_cooldown_ms(),
            playback_timeout_secs: default_playback_timeout_secs(),
            capture_restart: RestartConfig::default(),
        }
    }
}

impl TurnConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn playback_timeout(&self) -> Duration {
        Duration::from_secs(self.playback_timeout_secs)
    }
}

fn default_language() -> String {
    "en".into()
}
fn default_cooldown_ms() -> u64 {
    3000
}
fn default_playback_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RestartConfig {
    #[serde(default = "default_restart_delay_ms")]
    pub delay_ms: u64,
    /// 1.0 keeps the delay fixed
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive failed restarts before giving up (unset = retry forever)
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_restart_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: None,
        }
    }
}

fn default_restart_delay_ms() -> u64 {
    1000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}

// ============================================================================
// Gesture Config
// ============================================================================

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GrabMode {
    /// Fire once when the hand goes from open to closed
    #[default]
    RisingEdge,
    /// Fire on every closed frame
    EveryFrame,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GestureConfig {
    #[serde(default)]
    pub grab_mode: GrabMode,
    /// Consecutive closed frames before the fist counts as closed
    #[serde(default = "default_min_closed_frames")]
    pub min_closed_frames: u32,
    #[serde(default = "default_tip_suffix")]
    pub tip_suffix: String,
    #[serde(default = "default_knuckle_suffix")]
    pub knuckle_suffix: String,
    /// Text fed to the dialogue when a grab is detected
    #[serde(default = "default_grab_prompt")]
    pub grab_prompt: String,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            grab_mode: GrabMode::default(),
            min_closed_frames: default_min_closed_frames(),
            tip_suffix: default_tip_suffix(),
            knuckle_suffix: default_knuckle_suffix(),
            grab_prompt: default_grab_prompt(),
        }
    }
}

fn default_min_closed_frames() -> u32 {
    1
}
fn default_tip_suffix() -> String {
    "_tip".into()
}
fn default_knuckle_suffix() -> String {
    "_mcp".into()
}
fn default_grab_prompt() -> String {
    "Hello! I just made a fist at you.".into()
}

/// Expand ${VAR} to environment variable values
fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut from = 0;

    // substituted values are not expanded again
    while let Some(offset) = result[from..].find("${") {
        let start = from + offset;
        if let Some(end) = result[start..].find('}') {
            let var_name = &result[start + 2..start + end];
            let value = std::env::var(var_name).unwrap_or_else(|_| {
                tracing::warn!(var = var_name, "environment variable not set");
                String::new()
            });
            result.replace_range(start..start + end + 1, &value);
            from = start + value.len();
        } else {
            break;
        }
    }

    result
}

impl Config {
    /// Load from a TOML file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let text = fs::read_to_string(path)?;
            Self::parse(&text)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        };

        config.llm.resolve();

        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.turn.default_language, "en");
        assert_eq!(config.turn.cooldown(), Duration::from_secs(3));
        assert_eq!(config.gesture.grab_mode, GrabMode::RisingEdge);
        assert_eq!(config.gesture.min_closed_frames, 1);
        assert_eq!(config.speech.capture, CaptureBackend::Console);
    }

    #[test]
    fn sections_parse() {
        let config = Config::parse(
            r#"
            name = "Jo"

            [llm]
            provider = "openai"
            endpoint = "http://localhost:1234/v1/"
            deployment = "gpt-4o-mini"

            [speech]
            capture = "microphone"
            playback = "remote"
            voices = { fr = "nova", "pt-br" = "shimmer" }

            [turn]
            cooldown_ms = 500
            capture_restart = { delay_ms = 250, backoff_factor = 1.0, max_attempts = 3 }

            [gesture]
            grab_mode = "every-frame"
            min_closed_frames = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "Jo");
        assert_eq!(config.llm.provider, Provider::OpenAi);
        assert_eq!(config.speech.capture, CaptureBackend::Microphone);
        assert_eq!(config.speech.playback, PlaybackBackend::Remote);
        assert_eq!(config.turn.cooldown_ms, 500);
        assert_eq!(config.turn.capture_restart.max_attempts, Some(3));
        assert_eq!(config.gesture.grab_mode, GrabMode::EveryFrame);
        assert_eq!(config.gesture.min_closed_frames, 3);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(matches!(
            Config::parse("[turn]\ncooldown_ms = \"soon\""),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn resolve_trims_endpoint_and_applies_openai_default() {
        let mut llm = LlmConfig {
            provider: Provider::OpenAi,
            endpoint: String::new(),
            api_key: String::new(),
            deployment: "gpt-4o-mini".into(),
            ..LlmConfig::default()
        };
        llm.resolve();
        assert_eq!(llm.endpoint, "https://api.openai.com/v1");

        llm.endpoint = "https://example.openai.azure.com///".into();
        llm.resolve();
        assert_eq!(llm.endpoint, "https://example.openai.azure.com");
    }

    #[test]
    fn validate_rejects_missing_deployment() {
        let llm = LlmConfig {
            endpoint: "https://example.openai.azure.com".into(),
            deployment: String::new(),
            ..LlmConfig::default()
        };
        assert!(matches!(llm.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn env_vars_expand() {
        // SAFETY: test-local variable name, not read by other tests
        unsafe { std::env::set_var("HANDTALK_TEST_KEY", "secret") };
        assert_eq!(expand_env_vars("k=${HANDTALK_TEST_KEY}!"), "k=secret!");
        assert_eq!(expand_env_vars("${HANDTALK_TEST_UNSET_VAR}"), "");
        assert_eq!(expand_env_vars("no vars"), "no vars");
    }

    #[test]
    fn expanded_values_are_not_expanded_again() {
        // SAFETY: test-local variable name, not read by other tests
        unsafe { std::env::set_var("HANDTALK_TEST_SELF_REF", "${HANDTALK_TEST_SELF_REF}") };
        assert_eq!(
            expand_env_vars("a${HANDTALK_TEST_SELF_REF}b${HANDTALK_TEST_UNSET_VAR}c"),
            "a${HANDTALK_TEST_SELF_REF}bc"
        );
    }

    #[test]
    fn voice_lookup_falls_back_to_primary_subtag_then_default() {
        let mut speech = SpeechConfig::default();
        speech.voices.insert("fr".into(), "nova".into());
        assert_eq!(speech.voice_for("fr-CA"), "nova");
        assert_eq!(speech.voice_for("FR"), "nova");
        assert_eq!(speech.voice_for("de"), "alloy");
    }
}
