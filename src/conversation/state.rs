//! Turn-taking state machine.
//!
//! [`transition`] is pure: it maps a state and an event to the next state
//! and the effects the pipeline must carry out, in order.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Listening {
        /// The previous response was cut off by the caller.
        interrupted: bool,
    },
    AgentResponding {
        /// Goodbye was detected; the call ends when this response completes.
        ending: bool,
        /// Utterance waiting for the current response to finish when
        /// interruptions are disabled.
        queued: Option<String>,
    },
    Ended,
}

impl ConversationState {
    pub fn listening() -> Self {
        ConversationState::Listening { interrupted: false }
    }

    pub fn responding() -> Self {
        ConversationState::AgentResponding {
            ending: false,
            queued: None,
        }
    }

    pub fn is_responding(&self) -> bool {
        matches!(self, ConversationState::AgentResponding { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, ConversationState::Ended)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    /// The recognition session is up. `greeting` is spoken first if set.
    Started { greeting: Option<String> },
    /// A final, accepted caller utterance.
    HumanUtterance { text: String },
    /// Caller speech detected before a final transcription.
    BargeIn,
    /// The in-flight response ran to completion.
    ResponseCompleted { text: String, goodbye: bool },
    GoodbyeDetected,
    EndRequested,
    /// A worker could not start or stopped unexpectedly.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    AppendHumanTurn { text: String },
    AppendAgentTurn { text: String },
    StartResponse { human_input: String, is_interrupt: bool },
    StartGreeting { text: String },
    /// Abort the in-flight generation; nothing of it reaches the transcript.
    CancelResponse,
    /// Drop queued-but-unplayed audio of the aborted response.
    ClearOutput,
    /// Terminate every worker. With `flush_output` queued audio gets a
    /// bounded chance to play first.
    Shutdown { flush_output: bool },
}

/// Settings the transition function depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionContext {
    pub allow_interruptions: bool,
}

#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConversationState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConversationState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Conversation has ended")]
    Ended,
    #[error("Event {event} ignored in state {state}")]
    Ignored { state: String, event: String },
}

pub fn transition(
    state: &ConversationState,
    context: &TransitionContext,
    event: ConversationEvent,
) -> Result<TransitionResult, TransitionError> {
    use ConversationEvent as E;
    use ConversationState as S;

    match (state, event) {
        (S::Ended, _) => Err(TransitionError::Ended),

        // End wins from anywhere; any running response is discarded.
        (S::AgentResponding { .. }, E::EndRequested) => Ok(TransitionResult::new(S::Ended)
            .with_effect(Effect::CancelResponse)
            .with_effect(Effect::Shutdown {
                flush_output: false,
            })),
        (_, E::EndRequested) => Ok(TransitionResult::new(S::Ended).with_effect(Effect::Shutdown {
            flush_output: false,
        })),
        (S::AgentResponding { .. }, E::Fatal) => Ok(TransitionResult::new(S::Ended)
            .with_effect(Effect::CancelResponse)
            .with_effect(Effect::Shutdown { flush_output: true })),
        (_, E::Fatal) => Ok(TransitionResult::new(S::Ended)
            .with_effect(Effect::Shutdown { flush_output: true })),

        (S::Idle, E::Started { greeting: Some(text) }) => Ok(TransitionResult::new(
            S::responding(),
        )
        .with_effect(Effect::StartGreeting { text })),
        (S::Idle, E::Started { greeting: None }) => Ok(TransitionResult::new(S::listening())),

        (S::Listening { interrupted }, E::HumanUtterance { text }) => {
            Ok(TransitionResult::new(S::responding())
                .with_effect(Effect::AppendHumanTurn { text: text.clone() })
                .with_effect(Effect::StartResponse {
                    human_input: text,
                    is_interrupt: *interrupted,
                }))
        }

        // The call is ending: keep the words, start nothing.
        (S::AgentResponding { ending: true, .. }, E::HumanUtterance { text }) => {
            Ok(TransitionResult::new(state.clone()).with_effect(Effect::AppendHumanTurn { text }))
        }

        // Barge-in: abort, count the utterance, answer it.
        (S::AgentResponding { ending: false, .. }, E::HumanUtterance { text })
            if context.allow_interruptions =>
        {
            Ok(TransitionResult::new(S::responding())
                .with_effect(Effect::CancelResponse)
                .with_effect(Effect::ClearOutput)
                .with_effect(Effect::AppendHumanTurn { text: text.clone() })
                .with_effect(Effect::StartResponse {
                    human_input: text,
                    is_interrupt: true,
                }))
        }

        (S::AgentResponding { ending: false, queued }, E::HumanUtterance { text }) => {
            let queued = match queued {
                Some(earlier) => format!("{} {}", earlier, text),
                None => text.clone(),
            };
            Ok(TransitionResult::new(S::AgentResponding {
                ending: false,
                queued: Some(queued),
            })
            .with_effect(Effect::AppendHumanTurn { text }))
        }

        (S::AgentResponding { ending: false, .. }, E::BargeIn) if context.allow_interruptions => {
            Ok(TransitionResult::new(S::Listening { interrupted: true })
                .with_effect(Effect::CancelResponse)
                .with_effect(Effect::ClearOutput))
        }

        (S::AgentResponding { queued, .. }, E::GoodbyeDetected) => {
            Ok(TransitionResult::new(S::AgentResponding {
                ending: true,
                queued: queued.clone(),
            }))
        }
        (S::Listening { .. }, E::GoodbyeDetected) => Ok(TransitionResult::new(S::Ended)
            .with_effect(Effect::Shutdown { flush_output: true })),

        (S::AgentResponding { ending, queued }, E::ResponseCompleted { text, goodbye }) => {
            let mut result = if *ending || goodbye {
                TransitionResult::new(S::Ended)
            } else if let Some(queued) = queued {
                TransitionResult::new(S::responding()).with_effect(Effect::StartResponse {
                    human_input: queued.clone(),
                    is_interrupt: false,
                })
            } else {
                TransitionResult::new(S::listening())
            };
            if !text.is_empty() {
                result.effects.insert(0, Effect::AppendAgentTurn { text });
            }
            if result.new_state.is_ended() {
                result = result.with_effect(Effect::Shutdown { flush_output: true });
            }
            Ok(result)
        }

        (state, event) => Err(TransitionError::Ignored {
            state: format!("{:?}", state),
            event: format!("{:?}", event),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERRUPTIBLE: TransitionContext = TransitionContext {
        allow_interruptions: true,
    };

    fn utterance(text: &str) -> ConversationEvent {
        ConversationEvent::HumanUtterance {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_start_without_greeting_listens() {
        let result = transition(
            &ConversationState::Idle,
            &INTERRUPTIBLE,
            ConversationEvent::Started { greeting: None },
        )
        .unwrap();
        assert_eq!(result.new_state, ConversationState::listening());
        assert!(result.effects.is_empty());
    }

    #[test]
    fn test_start_with_greeting_responds() {
        let result = transition(
            &ConversationState::Idle,
            &INTERRUPTIBLE,
            ConversationEvent::Started {
                greeting: Some("Hello!".to_string()),
            },
        )
        .unwrap();
        assert!(result.new_state.is_responding());
        assert_eq!(
            result.effects,
            vec![Effect::StartGreeting {
                text: "Hello!".to_string()
            }]
        );
    }

    #[test]
    fn test_final_utterance_appends_then_starts_one_response() {
        let result = transition(
            &ConversationState::listening(),
            &INTERRUPTIBLE,
            utterance("book a flight"),
        )
        .unwrap();
        assert!(result.new_state.is_responding());
        assert_eq!(
            result.effects,
            vec![
                Effect::AppendHumanTurn {
                    text: "book a flight".to_string()
                },
                Effect::StartResponse {
                    human_input: "book a flight".to_string(),
                    is_interrupt: false
                },
            ]
        );
    }

    #[test]
    fn test_barge_in_cancels_before_starting_again() {
        let result = transition(
            &ConversationState::responding(),
            &INTERRUPTIBLE,
            utterance("no wait"),
        )
        .unwrap();
        assert_eq!(result.new_state, ConversationState::responding());
        assert_eq!(result.effects[0], Effect::CancelResponse);
        assert_eq!(result.effects[1], Effect::ClearOutput);
        assert_eq!(
            result.effects[3],
            Effect::StartResponse {
                human_input: "no wait".to_string(),
                is_interrupt: true
            }
        );
        let starts = result
            .effects
            .iter()
            .filter(|e| matches!(e, Effect::StartResponse { .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_partial_barge_in_returns_to_listening_flagged() {
        let result = transition(
            &ConversationState::responding(),
            &INTERRUPTIBLE,
            ConversationEvent::BargeIn,
        )
        .unwrap();
        assert_eq!(
            result.new_state,
            ConversationState::Listening { interrupted: true }
        );

        let next = transition(&result.new_state, &INTERRUPTIBLE, utterance("hold on")).unwrap();
        assert!(next.effects.contains(&Effect::StartResponse {
            human_input: "hold on".to_string(),
            is_interrupt: true
        }));
    }

    #[test]
    fn test_uninterruptible_queues_utterance_until_completion() {
        let context = TransitionContext {
            allow_interruptions: false,
        };
        let result =
            transition(&ConversationState::responding(), &context, utterance("and Oslo")).unwrap();
        assert!(!result.effects.contains(&Effect::CancelResponse));
        assert_eq!(
            result.effects,
            vec![Effect::AppendHumanTurn {
                text: "and Oslo".to_string()
            }]
        );
        assert!(
            transition(&result.new_state, &context, ConversationEvent::BargeIn).is_err()
        );

        let done = transition(
            &result.new_state,
            &context,
            ConversationEvent::ResponseCompleted {
                text: "Booked.".to_string(),
                goodbye: false,
            },
        )
        .unwrap();
        assert!(done.new_state.is_responding());
        assert_eq!(
            done.effects,
            vec![
                Effect::AppendAgentTurn {
                    text: "Booked.".to_string()
                },
                Effect::StartResponse {
                    human_input: "and Oslo".to_string(),
                    is_interrupt: false
                },
            ]
        );
    }

    #[test]
    fn test_completion_appends_agent_turn_and_listens() {
        let result = transition(
            &ConversationState::responding(),
            &INTERRUPTIBLE,
            ConversationEvent::ResponseCompleted {
                text: "Sure, let me help.".to_string(),
                goodbye: false,
            },
        )
        .unwrap();
        assert_eq!(result.new_state, ConversationState::listening());
        assert_eq!(
            result.effects,
            vec![Effect::AppendAgentTurn {
                text: "Sure, let me help.".to_string()
            }]
        );
    }

    #[test]
    fn test_goodbye_ends_after_completion_and_keeps_late_utterance() {
        let ending = transition(
            &ConversationState::responding(),
            &INTERRUPTIBLE,
            ConversationEvent::GoodbyeDetected,
        )
        .unwrap()
        .new_state;

        let late = transition(&ending, &INTERRUPTIBLE, utterance("wait, one more")).unwrap();
        assert_eq!(late.new_state, ending);
        assert_eq!(
            late.effects,
            vec![Effect::AppendHumanTurn {
                text: "wait, one more".to_string()
            }]
        );

        let done = transition(
            &ending,
            &INTERRUPTIBLE,
            ConversationEvent::ResponseCompleted {
                text: "Bye. STOP CALL".to_string(),
                goodbye: true,
            },
        )
        .unwrap();
        assert!(done.new_state.is_ended());
        assert_eq!(
            done.effects.last(),
            Some(&Effect::Shutdown { flush_output: true })
        );
    }

    #[test]
    fn test_end_request_from_any_live_state() {
        for state in [
            ConversationState::Idle,
            ConversationState::listening(),
            ConversationState::responding(),
        ] {
            let result =
                transition(&state, &INTERRUPTIBLE, ConversationEvent::EndRequested).unwrap();
            assert!(result.new_state.is_ended());
            assert_eq!(
                result.effects.last(),
                Some(&Effect::Shutdown {
                    flush_output: false
                })
            );
            assert_eq!(
                result.effects.contains(&Effect::CancelResponse),
                state.is_responding()
            );
        }
    }

    #[test]
    fn test_ended_accepts_nothing() {
        assert_eq!(
            transition(
                &ConversationState::Ended,
                &INTERRUPTIBLE,
                utterance("hello?")
            )
            .unwrap_err(),
            TransitionError::Ended
        );
    }

    #[test]
    fn test_fatal_flushes_output_before_shutdown() {
        let result = transition(
            &ConversationState::Idle,
            &INTERRUPTIBLE,
            ConversationEvent::Fatal,
        )
        .unwrap();
        assert!(result.new_state.is_ended());
        assert_eq!(
            result.effects,
            vec![Effect::Shutdown { flush_output: true }]
        );
    }
}
