//! Conditional edge functions for the workflow graph.
//!
//! Every function here is total: given any state it returns one of its
//! enumerated answers, defaulting to the safe option. The graph
//! executor consults these between nodes.

use crate::routing::ProcessingPath;
use crate::state::{ActivationStatus, Role, TurnState};
use chrono::Utc;

/// Outcome of the should-process gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldProcess {
    /// Run the turn.
    Continue,
    /// Nothing to do; end the turn.
    End,
}

/// Which track branch the dispatcher takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackBranch {
    /// Local track only (also the first leg of STAGED).
    Local,
    /// API track only.
    Api,
    /// Both tracks concurrently.
    Parallel,
}

/// Outcome of the completion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// All required tracks finished, or the guard timeout lapsed.
    Ready,
    /// Still waiting on a required track.
    Waiting,
}

/// Outcome of the synthesis gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synthesis {
    /// Synthesize the assistant message.
    Synthesize,
    /// Skip TTS.
    Skip,
}

/// Outcome of the memory-update gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUpdateGate {
    /// Store the new exchange.
    Update,
    /// Nothing new to store.
    Skip,
}

/// Outcome of the summarization gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Summarization {
    /// Compact the rolling history.
    Summarize,
    /// History is within bounds.
    Continue,
}

/// Gate the turn on activation status.
pub fn should_process(state: &TurnState) -> ShouldProcess {
    match state.activation.status {
        ActivationStatus::Listening | ActivationStatus::Processing | ActivationStatus::Speaking => {
            ShouldProcess::Continue
        }
        ActivationStatus::Inactive => ShouldProcess::End,
    }
}

/// Choose the dispatch branch from the routed path.
///
/// STAGED starts on the local branch; an unknown/missing path falls
/// back to running both tracks so no answer is lost.
pub fn determine_processing_path(state: &TurnState) -> TrackBranch {
    match state.processing.path {
        Some(ProcessingPath::Local) | Some(ProcessingPath::Staged) => TrackBranch::Local,
        Some(ProcessingPath::Api) => TrackBranch::Api,
        Some(ProcessingPath::Parallel) | None => TrackBranch::Parallel,
    }
}

/// Whether integration may run: every track the path requires has
/// completed, or the turn-level guard timeout lapsed.
pub fn check_processing_complete(state: &TurnState) -> Completion {
    let processing = &state.processing;

    let required_done = match processing.path {
        Some(ProcessingPath::Local) => processing.local_completed,
        Some(ProcessingPath::Api) => processing.api_completed,
        Some(ProcessingPath::Parallel) => processing.local_completed && processing.api_completed,
        // STAGED needs at least the local leg; the API leg only when it
        // was dispatched (its completion flag exists once it runs).
        Some(ProcessingPath::Staged) => processing.local_completed,
        None => false,
    };
    if required_done {
        return Completion::Ready;
    }

    let timed_out = match (processing.start_time, processing.guard_timeout_ms) {
        (Some(start), Some(guard_ms)) => {
            let elapsed = Utc::now().signed_duration_since(start);
            elapsed.num_milliseconds() >= 0 && elapsed.num_milliseconds() as u64 >= guard_ms
        }
        _ => false,
    };
    if timed_out {
        Completion::Ready
    } else {
        Completion::Waiting
    }
}

/// Gate TTS on a non-empty assistant reply and the config toggle.
pub fn should_synthesize_speech(state: &TurnState) -> Synthesis {
    if !state.config.tts_enabled {
        return Synthesis::Skip;
    }
    match state.last_assistant_message() {
        Some(message) if !message.content.trim().is_empty() => Synthesis::Synthesize,
        _ => Synthesis::Skip,
    }
}

/// Gate memory storage on a new completed (user, assistant) pair.
pub fn should_update_memory(state: &TurnState) -> MemoryUpdateGate {
    if !state.config.memory_enabled {
        return MemoryUpdateGate::Skip;
    }
    if state.messages.len() <= state.memory.last_stored_message_count {
        return MemoryUpdateGate::Skip;
    }
    let new_messages = &state.messages[state.memory.last_stored_message_count..];
    let has_user = new_messages.iter().any(|m| m.role == Role::User);
    let has_assistant = new_messages.iter().any(|m| m.role == Role::Assistant);
    if has_user && has_assistant {
        MemoryUpdateGate::Update
    } else {
        MemoryUpdateGate::Skip
    }
}

/// Gate summarization on rolling history length.
pub fn should_summarize_conversation(state: &TurnState) -> Summarization {
    if state.memory.conversation_history.len() > state.config.summarization_threshold {
        Summarization::Summarize
    } else {
        Summarization::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ChatMessage, ExchangePair};

    #[test]
    fn process_gate_follows_status() {
        let mut state = TurnState::default();
        assert_eq!(should_process(&state), ShouldProcess::End);
        for status in [
            ActivationStatus::Listening,
            ActivationStatus::Processing,
            ActivationStatus::Speaking,
        ] {
            state.activation.status = status;
            assert_eq!(should_process(&state), ShouldProcess::Continue);
        }
    }

    #[test]
    fn unknown_path_falls_back_to_parallel() {
        let state = TurnState::default();
        assert_eq!(determine_processing_path(&state), TrackBranch::Parallel);
    }

    #[test]
    fn staged_starts_on_local_branch() {
        let mut state = TurnState::default();
        state.processing.path = Some(ProcessingPath::Staged);
        assert_eq!(determine_processing_path(&state), TrackBranch::Local);
    }

    #[test]
    fn parallel_completion_needs_both_tracks() {
        let mut state = TurnState::default();
        state.processing.path = Some(ProcessingPath::Parallel);
        assert_eq!(check_processing_complete(&state), Completion::Waiting);
        state.processing.local_completed = true;
        assert_eq!(check_processing_complete(&state), Completion::Waiting);
        state.processing.api_completed = true;
        assert_eq!(check_processing_complete(&state), Completion::Ready);
    }

    #[test]
    fn guard_timeout_forces_ready() {
        let mut state = TurnState::default();
        state.processing.path = Some(ProcessingPath::Parallel);
        state.processing.start_time = Some(Utc::now() - chrono::Duration::seconds(60));
        state.processing.guard_timeout_ms = Some(1_000);
        assert_eq!(check_processing_complete(&state), Completion::Ready);
    }

    #[test]
    fn synthesis_needs_content_and_toggle() {
        let mut state = TurnState::default();
        assert_eq!(should_synthesize_speech(&state), Synthesis::Skip);
        state.messages.push(ChatMessage::assistant("Hello!"));
        assert_eq!(should_synthesize_speech(&state), Synthesis::Synthesize);
        state.config.tts_enabled = false;
        assert_eq!(should_synthesize_speech(&state), Synthesis::Skip);
        state.config.tts_enabled = true;
        state.messages.push(ChatMessage::assistant("   "));
        // Latest assistant message is blank.
        assert_eq!(should_synthesize_speech(&state), Synthesis::Skip);
    }

    #[test]
    fn memory_gate_requires_new_complete_pair() {
        let mut state = TurnState::default();
        assert_eq!(should_update_memory(&state), MemoryUpdateGate::Skip);
        state.messages.push(ChatMessage::user("hi"));
        assert_eq!(should_update_memory(&state), MemoryUpdateGate::Skip);
        state.messages.push(ChatMessage::assistant("hello"));
        assert_eq!(should_update_memory(&state), MemoryUpdateGate::Update);
        state.memory.last_stored_message_count = 2;
        assert_eq!(should_update_memory(&state), MemoryUpdateGate::Skip);
        state.config.memory_enabled = false;
        state.messages.push(ChatMessage::user("more"));
        state.messages.push(ChatMessage::assistant("words"));
        assert_eq!(should_update_memory(&state), MemoryUpdateGate::Skip);
    }

    #[test]
    fn summarization_trips_above_threshold() {
        let mut state = TurnState::default();
        state.config.summarization_threshold = 2;
        let pair = ExchangePair {
            user: "u".to_owned(),
            assistant: "a".to_owned(),
            exchange_time: Utc::now(),
        };
        state.memory.conversation_history = vec![pair.clone(), pair.clone()];
        assert_eq!(should_summarize_conversation(&state), Summarization::Continue);
        state.memory.conversation_history.push(pair);
        assert_eq!(
            should_summarize_conversation(&state),
            Summarization::Summarize
        );
    }
}
