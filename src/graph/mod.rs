//! The workflow graph: node ordering, conditional edges, and the
//! parallel track dispatcher for one conversation turn.
//!
//! Nodes run as tokio tasks; the local and API tracks are truly
//! concurrent on the PARALLEL path. Node failures never abort a turn —
//! they are folded into the state and the integrator copes with missing
//! responses. A turn-level guard timeout (twice the slower track's
//! deadline) forces integration to run with whatever is available.

use crate::error::Result;
use crate::integration::FALLBACK_RESPONSE;
use crate::routing::ProcessingPath;
use crate::state::{
    ActivationStatus, ActivationUpdate, ProcessingUpdate, StateUpdate, TurnState,
};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod nodes;
pub mod routing;

pub use nodes::TurnNodes;
pub use routing::{
    Completion, MemoryUpdateGate, ShouldProcess, Summarization, Synthesis, TrackBranch,
    check_processing_complete, determine_processing_path, should_process,
    should_summarize_conversation, should_synthesize_speech, should_update_memory,
};

/// How one turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The turn produced an assistant response.
    Completed {
        /// The final response text.
        response: String,
    },
    /// The turn had nothing to process (inactive, or STT yielded no text).
    Skipped,
    /// The user interrupted; partial work was discarded.
    Cancelled,
}

/// Executes turns over a fixed node graph.
pub struct WorkflowGraph {
    nodes: Arc<TurnNodes>,
}

impl WorkflowGraph {
    /// Build the graph over an assembled node set.
    pub fn new(nodes: TurnNodes) -> Self {
        Self {
            nodes: Arc::new(nodes),
        }
    }

    /// Drive one turn to completion, mutating `state` through the
    /// reducers. Cancellation discards in-flight track work and reports
    /// [`TurnOutcome::Cancelled`]; the caller resets the state.
    pub async fn execute_turn(
        &self,
        state: &mut TurnState,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.run_and_apply("check_activation", state, cancel).await?;
        if should_process(state) == ShouldProcess::End {
            debug!("activation gate closed, skipping turn");
            return Ok(TurnOutcome::Skipped);
        }

        let had_frame = state.audio.pending_frame.is_some();
        let messages_before = state.messages.len();
        self.run_and_apply("stt", state, cancel).await?;
        // A voice turn needs a freshly transcribed message; a
        // text-injected turn arrives with its user message already in
        // the log.
        let heard_user = if had_frame {
            state.messages.len() > messages_before
        } else {
            state.last_user_message().is_some()
        };
        if !heard_user {
            debug!("no user utterance this turn");
            return Ok(TurnOutcome::Skipped);
        }

        self.run_and_apply("retrieve_memory", state, cancel).await?;
        self.run_and_apply("router", state, cancel).await?;

        if self.dispatch_tracks(state, cancel).await? == DispatchOutcome::Cancelled {
            return Ok(TurnOutcome::Cancelled);
        }

        if check_processing_complete(state) == Completion::Waiting {
            warn!("completion check still waiting after dispatch; integrating anyway");
        }

        self.run_and_apply("integration", state, cancel).await?;

        match should_synthesize_speech(state) {
            Synthesis::Synthesize => {
                self.run_and_apply("tts", state, cancel).await?;
            }
            Synthesis::Skip => {
                StateUpdate::activation(ActivationUpdate {
                    status: Some(ActivationStatus::Inactive),
                    ..ActivationUpdate::default()
                })
                .apply(state);
            }
        }

        if cancel.is_cancelled() {
            // Barge-in after the reply: keep the response but do not
            // update memory for a cancelled turn.
            return Ok(TurnOutcome::Cancelled);
        }

        if should_update_memory(state) == MemoryUpdateGate::Update {
            self.run_and_apply("store_memory", state, cancel).await?;
            if should_summarize_conversation(state) == Summarization::Summarize {
                self.run_and_apply("summarize_memory", state, cancel).await?;
            }
            self.run_and_apply("prune_memory", state, cancel).await?;
        }

        let response = state
            .processing
            .final_response
            .clone()
            .unwrap_or_else(|| FALLBACK_RESPONSE.to_owned());
        Ok(TurnOutcome::Completed { response })
    }

    /// Run one named node against a snapshot and apply its update.
    ///
    /// A node error is folded into the state (`processing.errors`) and,
    /// for track nodes, marks the track completed to avoid deadlocking
    /// the completion check.
    async fn run_and_apply(
        &self,
        name: &'static str,
        state: &mut TurnState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() && is_cancellable(name) {
            return Ok(());
        }
        let snapshot = state.clone();
        let result = self.run_node(name, &snapshot).await;
        let update = match result {
            Ok(update) => update,
            Err(e) => {
                warn!(node = name, error = %e, "node failed");
                failure_update(name, &e.to_string())
            }
        };
        update.apply(state);
        Ok(())
    }

    async fn run_node(&self, name: &'static str, state: &TurnState) -> Result<StateUpdate> {
        let nodes = &self.nodes;
        match name {
            "check_activation" => nodes.check_activation(state).await,
            "stt" => nodes.stt(state).await,
            "retrieve_memory" => nodes.retrieve_memory(state).await,
            "router" => nodes.route(state).await,
            "local_processing" => nodes.local_processing(state).await,
            "api_processing" => nodes.api_processing(state).await,
            "integration" => nodes.integration(state).await,
            "tts" => nodes.tts(state).await,
            "store_memory" => nodes.store_memory(state).await,
            "summarize_memory" => nodes.summarize_memory(state).await,
            "prune_memory" => nodes.prune_memory(state).await,
            other => {
                warn!(node = other, "unknown node requested");
                Ok(StateUpdate::default())
            }
        }
    }

    /// Run the track node(s) the routed path requires.
    async fn dispatch_tracks(
        &self,
        state: &mut TurnState,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        let guard_ms = state.processing.guard_timeout_ms.unwrap_or(60_000);
        let guard = Duration::from_millis(guard_ms);

        match determine_processing_path(state) {
            TrackBranch::Parallel => self.dispatch_parallel(state, cancel, guard).await,
            TrackBranch::Api => {
                self.dispatch_single("api_processing", state, cancel, guard)
                    .await
            }
            TrackBranch::Local => {
                let outcome = self
                    .dispatch_single("local_processing", state, cancel, guard)
                    .await?;
                if outcome == DispatchOutcome::Cancelled {
                    return Ok(outcome);
                }
                // STAGED escalates to the API when the local result is
                // insufficient.
                if state.processing.path == Some(ProcessingPath::Staged)
                    && !self.local_result_sufficient(state)
                {
                    info!("staged path escalating to API track");
                    return self
                        .dispatch_single("api_processing", state, cancel, guard)
                        .await;
                }
                Ok(DispatchOutcome::Finished)
            }
        }
    }

    fn local_result_sufficient(&self, state: &TurnState) -> bool {
        let min_tokens = self.nodes.config.integration.min_acceptable_tokens;
        state
            .processing
            .local_response
            .as_ref()
            .is_some_and(|r| r.is_sufficient(min_tokens))
    }

    /// Run one track node under the guard timeout.
    async fn dispatch_single(
        &self,
        name: &'static str,
        state: &mut TurnState,
        cancel: &CancellationToken,
        guard: Duration,
    ) -> Result<DispatchOutcome> {
        let snapshot = state.clone();
        let nodes = Arc::clone(&self.nodes);
        let handle = tokio::spawn(async move {
            match name {
                "local_processing" => nodes.local_processing(&snapshot).await,
                _ => nodes.api_processing(&snapshot).await,
            }
        });
        let abort = handle.abort_handle();

        tokio::select! {
            () = cancel.cancelled() => {
                abort.abort();
                info!(node = name, "track cancelled by user");
                Ok(DispatchOutcome::Cancelled)
            }
            () = tokio::time::sleep(guard) => {
                abort.abort();
                warn!(node = name, "turn guard timeout fired");
                failure_update(name, "turn guard timeout").apply(state);
                Ok(DispatchOutcome::Finished)
            }
            joined = handle => {
                let update = match joined {
                    Ok(Ok(update)) => update,
                    Ok(Err(e)) => failure_update(name, &e.to_string()),
                    Err(e) => failure_update(name, &format!("task failed: {e}")),
                };
                update.apply(state);
                Ok(DispatchOutcome::Finished)
            }
        }
    }

    /// Run both tracks concurrently.
    ///
    /// Results apply in completion order; the tracks write disjoint
    /// sub-keys of `processing`, so neither order loses data.
    async fn dispatch_parallel(
        &self,
        state: &mut TurnState,
        cancel: &CancellationToken,
        guard: Duration,
    ) -> Result<DispatchOutcome> {
        let snapshot = state.clone();
        let mut tasks = FuturesUnordered::new();
        let mut aborts = Vec::new();
        for name in ["local_processing", "api_processing"] {
            let nodes = Arc::clone(&self.nodes);
            let snapshot = snapshot.clone();
            let handle = tokio::spawn(async move {
                let result = match name {
                    "local_processing" => nodes.local_processing(&snapshot).await,
                    _ => nodes.api_processing(&snapshot).await,
                };
                (name, result)
            });
            aborts.push(handle.abort_handle());
            tasks.push(handle);
        }

        let drain = async {
            let mut updates = Vec::new();
            while let Some(joined) = tasks.next().await {
                match joined {
                    Ok((name, Ok(update))) => updates.push((name, update)),
                    Ok((name, Err(e))) => {
                        updates.push((name, failure_update(name, &e.to_string())));
                    }
                    Err(e) => warn!(error = %e, "parallel track task failed"),
                }
            }
            updates
        };

        tokio::select! {
            () = cancel.cancelled() => {
                for abort in &aborts {
                    abort.abort();
                }
                info!("parallel tracks cancelled by user");
                Ok(DispatchOutcome::Cancelled)
            }
            () = tokio::time::sleep(guard) => {
                for abort in &aborts {
                    abort.abort();
                }
                warn!("turn guard timeout fired during parallel dispatch");
                failure_update("local_processing", "turn guard timeout").apply(state);
                failure_update("api_processing", "turn guard timeout").apply(state);
                Ok(DispatchOutcome::Finished)
            }
            updates = drain => {
                for (_, update) in updates {
                    update.apply(state);
                }
                Ok(DispatchOutcome::Finished)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Finished,
    Cancelled,
}

/// Whether a node may be skipped once cancellation is requested.
fn is_cancellable(name: &str) -> bool {
    matches!(name, "store_memory" | "summarize_memory" | "prune_memory" | "tts")
}

/// The state update recorded when a node fails outright: the error
/// string, plus completion flags for track nodes so the completion
/// check cannot deadlock.
fn failure_update(name: &str, message: &str) -> StateUpdate {
    let mut update = ProcessingUpdate::error(name, message);
    match name {
        "local_processing" => update.local_completed = Some(true),
        "api_processing" => update.api_completed = Some(true),
        _ => {}
    }
    StateUpdate::processing(update)
}
