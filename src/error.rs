//! Error types for voxline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxlineError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Missing credential: {name} must be set in config or environment")]
    MissingCredential { name: String },

    // Worker errors
    #[error("Worker '{worker}' is not running")]
    WorkerNotRunning { worker: String },

    #[error("Worker '{worker}' failed to start: {message}")]
    WorkerStartFailed { worker: String, message: String },

    #[error("Queue closed: {queue}")]
    QueueClosed { queue: String },

    #[error("Queue full: {queue}")]
    QueueFull { queue: String },

    // Transcription errors
    #[error("Transcription error: {message}")]
    Transcription { message: String },

    #[error("Recognition session failed: {message}")]
    Session { message: String },

    // Agent errors
    #[error("Agent backend error: {message}")]
    Backend { message: String },

    #[error("Response generation already consumed")]
    GenerationConsumed,

    #[error("Operation cancelled")]
    Cancelled,

    // Output errors
    #[error("Speech synthesis failed: {message}")]
    Synthesis { message: String },

    #[error("Audio output failed: {message}")]
    Output { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    // Action errors
    #[error("Unknown action: {name}")]
    UnknownAction { name: String },

    #[error("Signaling request failed: {message}")]
    Signaling { message: String },

    #[error("Conversation has ended")]
    ConversationEnded,

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoxlineError {
    /// Returns true for cancellation, which callers treat as a normal outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, VoxlineError::Cancelled)
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxlineError>;
