//! Prompt assembly from a transcript.
//!
//! Summary policy:
//! - No summary: system preamble (if any) followed by the last
//!   `max_turns` turns.
//! - Summary with preamble: one system message `preamble + "\n" + summary`,
//!   then the last `last_messages_cnt` turns.
//! - Summary without preamble: the summary becomes its own leading system
//!   message, then the last `last_messages_cnt` turns.
//!
//! A leading system preamble is never dropped.

use crate::agent::ChatMessage;
use crate::transcript::{Role, Transcript, Turn};

/// Builds chat messages for `transcript`.
///
/// `fallback_preamble` is used when the transcript does not start with its
/// own system turn.
pub fn build_messages(
    transcript: &Transcript,
    fallback_preamble: &str,
    last_messages_cnt: usize,
    max_turns: usize,
) -> Vec<ChatMessage> {
    let view = transcript.context(last_messages_cnt, max_turns);
    let preamble = view
        .preamble
        .map(|t| t.text.as_str())
        .filter(|p| !p.is_empty())
        .or(Some(fallback_preamble).filter(|p| !p.is_empty()));

    let mut messages = Vec::with_capacity(view.turns.len() + 1);
    match (preamble, view.summary) {
        (Some(preamble), Some(summary)) => {
            messages.push(ChatMessage::system(format!("{}\n{}", preamble, summary)));
        }
        (Some(preamble), None) => messages.push(ChatMessage::system(preamble)),
        (None, Some(summary)) => messages.push(ChatMessage::system(summary)),
        (None, None) => {}
    }

    messages.extend(view.turns.iter().map(to_message));
    messages
}

fn to_message(turn: &Turn) -> ChatMessage {
    match (turn.role, &turn.action) {
        (_, Some(record)) => ChatMessage::function(&record.action, turn.text.clone()),
        (Role::Human, None) => ChatMessage::user(turn.text.clone()),
        (Role::Agent, None) => ChatMessage::assistant(turn.text.clone()),
        (Role::System, None) => ChatMessage::system(turn.text.clone()),
    }
}
