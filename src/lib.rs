//! Sona: voice-first conversational assistant core.
//!
//! The crate implements the dual-track scheduling heart of a voice
//! assistant: each user utterance is routed to a fast on-device model,
//! a high-quality remote model, or both in coordination, and the
//! results are fused under latency, cost, and quality constraints.
//!
//! # Architecture
//!
//! A turn flows through a workflow graph over a shared typed state:
//! activation gate → STT → memory retrieval → router → local/API
//! track(s) → integration → TTS → memory store → checkpoint.
//!
//! - **State** ([`state`]): the typed turn record and its reducers
//! - **Router** ([`routing`]): query classification and path selection
//! - **Tracks** ([`tracks`]): the on-device and remote controllers
//! - **Integrator** ([`integration`]): response fusion strategies
//! - **Optimizer** ([`optimizer`]): metrics, resources, and adaptation
//! - **Graph** ([`graph`]): node orchestration and parallel dispatch
//! - **Memory** ([`memory`]): the external engine interface
//! - **Persistence** ([`persistence`]): per-conversation checkpoints
//! - **Voice** ([`voice`]): STT/TTS/VAD/wake-word contracts and the
//!   activation state machine
//!
//! Concrete engines (audio devices, STT/TTS models, the quantized local
//! runtime, the vector store) live outside this crate and plug in
//! through the trait seams in [`runtime::Collaborators`].

pub mod config;
pub mod error;
pub mod graph;
pub mod integration;
pub mod memory;
pub mod optimizer;
pub mod persistence;
pub mod registry;
pub mod routing;
pub mod runtime;
pub mod state;
pub mod testing;
pub mod tracks;
pub mod voice;

pub use config::AssistantConfig;
pub use error::{AssistantError, Result};
pub use graph::{TurnOutcome, WorkflowGraph};
pub use runtime::{Assistant, Collaborators};
pub use state::TurnState;
