//! voxline - real-time voice conversations with barge-in
//!
//! Caller audio is transcribed incrementally, final utterances drive a
//! streaming agent, and the response is synthesized to an output device
//! while the caller can still cut it off.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod actions;
pub mod agent;
pub mod audio;
pub mod config;
pub mod conversation;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod output;
pub mod synthesizer;
pub mod transcriber;
pub mod transcript;
pub mod worker;

// Conversation
pub use conversation::{
    ConversationConfig, ConversationHandle, ConversationPipeline, ConversationState,
};

// Components (audio in -> agent -> audio out)
pub use actions::{Action, ActionsWorker, DtmfAction};
pub use agent::{Agent, ChatAgent, ChatBackend, Generation, ResponseFragment};
pub use audio::{AudioEncoding, AudioFrame};
pub use output::{AudioSink, OutputDevice};
pub use synthesizer::Synthesizer;
pub use transcriber::{Transcriber, Transcription};
pub use transcript::Transcript;

// Error handling
pub use error::{Result, VoxlineError};

// Config
pub use config::Config;

// Worker framework (for custom components)
pub use worker::{AsyncWorker, TaskWorker, ThreadWorker, Worker, WorkerError, WorkerHandle};

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
