use crate::audio::AudioEncoding;
use crate::defaults;
use crate::error::{Result, VoxlineError};
use crate::worker::ShutdownPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub transcriber: TranscriberConfig,
    pub agent: AgentConfig,
    pub telephony: TelephonyConfig,
    pub dtmf: DtmfConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

/// Audio format of the call leg
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub sampling_rate: u32,
    pub encoding: AudioEncoding,
    pub frame_ms: u32,
}

/// Turn-taking configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscriberConfig {
    /// Final transcriptions below this confidence are ignored.
    pub min_confidence: f32,
    /// Treat partial transcriptions during agent speech as barge-in.
    pub interrupt_on_partial: bool,
    /// Replace inbound audio with silence while the agent speaks.
    pub mute_during_agent_speech: bool,
}

/// Agent and chat backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub prompt_preamble: String,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Reply with a fixed phrase instead of calling the model on barge-in.
    pub send_filler_on_interrupt: bool,
    pub cut_off_response: Vec<String>,
    pub goodbye_phrase: Option<String>,
    pub last_messages_cnt: usize,
    /// Prompt bound without a summary; the oldest turns go first.
    pub max_context_turns: usize,
    pub initial_message: Option<String>,
    /// Caller line the first reply is generated for ahead of the call.
    pub expected_first_prompt: Option<String>,
    /// Endpoint of a user-implemented agent, used instead of the chat model.
    pub respond_url: Option<String>,
    /// Enables the context tracker when set.
    pub context_prompt: Option<String>,
    pub allow_interruptions: bool,
}

/// Telephony leg configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TelephonyConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub call_id: Option<String>,
    pub stream_id: Option<String>,
}

/// How DTMF digits reach the far end
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DtmfMode {
    /// Ask the telephony provider to press the digits.
    Signaling,
    /// Synthesize tones into the outbound audio.
    #[default]
    InBand,
}

/// DTMF action configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DtmfConfig {
    pub mode: DtmfMode,
    pub tone_ms: u32,
    pub inter_digit_ms: u64,
}

/// Output device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub shutdown: ShutdownPolicy,
    /// Optional WAV file receiving a copy of everything played.
    pub record_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sampling_rate: defaults::TELEPHONY_SAMPLING_RATE,
            encoding: AudioEncoding::Mulaw,
            frame_ms: defaults::FRAME_MS,
        }
    }
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            min_confidence: defaults::MIN_CONFIDENCE,
            interrupt_on_partial: false,
            mute_during_agent_speech: false,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            prompt_preamble: "You are a helpful voice assistant on a phone call.".to_string(),
            model: defaults::CHAT_MODEL.to_string(),
            base_url: defaults::OPENAI_BASE_URL.to_string(),
            api_key: None,
            max_tokens: defaults::MAX_TOKENS,
            temperature: defaults::TEMPERATURE,
            send_filler_on_interrupt: false,
            cut_off_response: vec![defaults::CUT_OFF_RESPONSE.to_string()],
            goodbye_phrase: Some(defaults::GOODBYE_PHRASE.to_string()),
            last_messages_cnt: defaults::LAST_MESSAGES_CNT,
            max_context_turns: defaults::MAX_CONTEXT_TURNS,
            initial_message: None,
            expected_first_prompt: None,
            respond_url: None,
            context_prompt: None,
            allow_interruptions: true,
        }
    }
}

impl Default for DtmfConfig {
    fn default() -> Self {
        Self {
            mode: DtmfMode::default(),
            tone_ms: defaults::DTMF_TONE_MS,
            inter_digit_ms: defaults::DTMF_INTER_DIGIT_MS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only missing files fall back to defaults; invalid TOML is an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXLINE_OPENAI_API_KEY → agent.api_key
    /// - VOXLINE_OPENAI_BASE_URL → agent.base_url
    /// - VOXLINE_TELEPHONY_API_KEY → telephony.api_key
    /// - VOXLINE_LOG_LEVEL → logging.level
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("VOXLINE_OPENAI_API_KEY")
            && !key.is_empty()
        {
            self.agent.api_key = Some(key);
        }

        if let Ok(url) = std::env::var("VOXLINE_OPENAI_BASE_URL")
            && !url.is_empty()
        {
            self.agent.base_url = url;
        }

        if let Ok(key) = std::env::var("VOXLINE_TELEPHONY_API_KEY")
            && !key.is_empty()
        {
            self.telephony.api_key = Some(key);
        }

        if let Ok(level) = std::env::var("VOXLINE_LOG_LEVEL")
            && !level.is_empty()
        {
            self.logging.level = level;
        }

        self
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.audio.sampling_rate == 0 {
            return Err(invalid("audio.sampling_rate", "must be positive"));
        }
        if self.audio.frame_ms == 0 {
            return Err(invalid("audio.frame_ms", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.transcriber.min_confidence) {
            return Err(invalid(
                "transcriber.min_confidence",
                "must be between 0.0 and 1.0",
            ));
        }
        if self.agent.send_filler_on_interrupt && self.agent.cut_off_response.is_empty() {
            return Err(invalid(
                "agent.cut_off_response",
                "must not be empty when send_filler_on_interrupt is set",
            ));
        }
        if self.agent.max_context_turns == 0 {
            return Err(invalid("agent.max_context_turns", "must be positive"));
        }
        if self.dtmf.tone_ms == 0 {
            return Err(invalid("dtmf.tone_ms", "must be positive"));
        }
        if self.dtmf.mode == DtmfMode::Signaling && self.telephony.call_id.is_none() {
            return Err(invalid(
                "telephony.call_id",
                "required when dtmf.mode is signaling",
            ));
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxline/config.toml on Linux, or None when the
    /// platform has no config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("voxline").join("config.toml"))
    }
}

fn invalid(key: &str, message: &str) -> VoxlineError {
    VoxlineError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
