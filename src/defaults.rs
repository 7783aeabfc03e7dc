//! Default configuration constants for voxline.
//!
//! Shared by the config structs and the components that fall back to them
//! when constructed without a config.

/// Telephony sampling rate in Hz (8kHz narrowband).
pub const TELEPHONY_SAMPLING_RATE: u32 = 8000;

/// Default sampling rate for browser and local audio in Hz.
pub const SAMPLING_RATE: u32 = 16000;

/// Default speaker sampling rate when the device reports none.
pub const SPEAKER_SAMPLING_RATE: u32 = 44100;

/// Default audio frame duration in milliseconds.
pub const FRAME_MS: u32 = 20;

/// Transcriptions below this confidence never close a human turn.
pub const MIN_CONFIDENCE: f32 = 0.0;

/// Phrase the agent emits to signal the call should end.
pub const GOODBYE_PHRASE: &str = "STOP CALL";

/// Fixed reply used when the agent is cut off mid-response.
pub const CUT_OFF_RESPONSE: &str = "Sorry?";

/// Number of recent turns kept verbatim once a summary exists.
pub const LAST_MESSAGES_CNT: usize = 4;

/// Request timeout of the user-implemented agent endpoint.
pub const RESTFUL_AGENT_TIMEOUT_MS: u64 = 15_000;

/// Most turns sent to the model when no summary exists.
pub const MAX_CONTEXT_TURNS: usize = 20;

/// Default chat model name.
pub const CHAT_MODEL: &str = "gpt-3.5-turbo";

/// Default chat backend base URL.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default maximum tokens per generation.
pub const MAX_TOKENS: u32 = 256;

/// Default sampling temperature.
pub const TEMPERATURE: f32 = 0.7;

/// Duration of a single DTMF tone burst in milliseconds.
pub const DTMF_TONE_MS: u32 = 300;

/// Pause between consecutive DTMF tones in milliseconds.
///
/// Matches the tone length so emitted bursts never overlap on the wire.
pub const DTMF_INTER_DIGIT_MS: u64 = 300;

/// Peak amplitude of each DTMF component, as a fraction of full scale.
pub const DTMF_AMPLITUDE: f64 = 0.5;

/// Default closing line spoken when the recognition session cannot start.
pub const ERROR_CLOSING_MESSAGE: &str = "Sorry, something went wrong. Goodbye.";

/// Default telephony control-plane base URL.
pub const TELEPHONY_BASE_URL: &str = "https://api.nexmo.com";

/// Timeout for telephony signaling requests in seconds.
pub const SIGNALING_TIMEOUT_SECS: u64 = 15;

/// Default log level when neither config nor RUST_LOG set one.
pub const LOG_LEVEL: &str = "info";

/// Longest wait for queued agent audio to play out before shutdown.
pub const OUTPUT_DRAIN_TIMEOUT_MS: u64 = 5000;

/// Longest wait for a terminated worker to stop before detaching it.
pub const WORKER_SHUTDOWN_TIMEOUT_MS: u64 = 2000;
