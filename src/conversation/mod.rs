//! Conversation orchestration.
//!
//! [`ConversationPipeline`] owns the turn-taking state machine in
//! [`state`]. Caller audio goes to the transcriber, final utterances start
//! one agent response at a time, response text is synthesized into the
//! output device and action calls go to the actions worker. Caller speech
//! during a response cancels it and flushes its unplayed audio.

mod pipeline;
mod response;
pub mod state;

pub use pipeline::{ConversationConfig, ConversationHandle, ConversationPipeline};
pub use state::{
    ConversationEvent, ConversationState, Effect, TransitionContext, TransitionError,
    TransitionResult, transition,
};
