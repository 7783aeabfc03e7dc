//! Running record of a conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Agent,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Human => write!(f, "Human"),
            Role::Agent => write!(f, "Agent"),
            Role::System => write!(f, "System"),
        }
    }
}

/// Outcome of an action, attached to the turn that reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionRecord>,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            action: None,
        }
    }
}

/// Prompt-sized view of a transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextView<'a> {
    /// Leading system turn, never evicted.
    pub preamble: Option<&'a Turn>,
    pub summary: Option<&'a str>,
    /// Turns after the preamble, possibly cut to the recency window.
    pub turns: &'a [Turn],
}

/// Append-only log of turns.
///
/// Older turns are never removed; once a summary is set, [`Transcript::context`]
/// substitutes it for everything before the recency window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    turns: Vec<Turn>,
    summary: Option<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a transcript whose first entry is the system preamble.
    pub fn with_preamble(preamble: impl Into<String>) -> Self {
        let mut transcript = Self::new();
        transcript.push(Turn::new(Role::System, preamble));
        transcript
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn add_human_message(&mut self, text: impl Into<String>) {
        self.push(Turn::new(Role::Human, text));
    }

    pub fn add_agent_message(&mut self, text: impl Into<String>) {
        self.push(Turn::new(Role::Agent, text));
    }

    pub fn add_action_result(&mut self, action: &str, success: bool, message: impl Into<String>) {
        let mut turn = Turn::new(Role::System, message);
        turn.action = Some(ActionRecord {
            action: action.to_string(),
            success,
        });
        self.push(turn);
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary = Some(summary.into());
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn last_human_message(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::Human)
            .map(|t| t.text.as_str())
    }

    /// The first turn when it is a plain system message.
    pub fn preamble(&self) -> Option<&Turn> {
        self.turns
            .first()
            .filter(|t| t.role == Role::System && t.action.is_none())
    }

    /// Builds the prompt view.
    ///
    /// With a summary only the last `last_messages_cnt` turns after the
    /// preamble remain; without one, the last `max_turns`. The preamble is
    /// always kept.
    pub fn context(&self, last_messages_cnt: usize, max_turns: usize) -> ContextView<'_> {
        let preamble = self.preamble();
        let body = if preamble.is_some() {
            &self.turns[1..]
        } else {
            &self.turns[..]
        };
        let window = match self.summary {
            Some(_) => last_messages_cnt,
            None => max_turns,
        };
        let turns = &body[body.len().saturating_sub(window)..];
        ContextView {
            preamble,
            summary: self.summary.as_deref(),
            turns,
        }
    }
}

impl fmt::Display for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for turn in &self.turns {
            writeln!(f, "{}: {}", turn.role, turn.text)?;
        }
        Ok(())
    }
}
