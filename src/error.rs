//! Error types for the assistant core.

/// Top-level error type for the dual-track assistant.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// Configuration error (invalid values, unknown enums).
    #[error("config error: {0}")]
    Config(String),

    /// Local model error (load, generation, tokenization).
    #[error("local model error: {0}")]
    LocalModel(String),

    /// Remote model transport or protocol error.
    #[error("remote model error: {0}")]
    RemoteModel(String),

    /// Routing error.
    #[error("routing error: {0}")]
    Routing(String),

    /// Response integration error.
    #[error("integration error: {0}")]
    Integration(String),

    /// Voice I/O error (STT, TTS, audio device).
    #[error("voice error: {0}")]
    Voice(String),

    /// Memory engine error (retrieval, storage, summarization).
    #[error("memory error: {0}")]
    Memory(String),

    /// Checkpoint read/write error.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Workflow graph coordination error.
    #[error("graph error: {0}")]
    Graph(String),

    /// Optimizer error (metrics, resource monitoring, adaptation).
    #[error("optimizer error: {0}")]
    Optimizer(String),

    /// Deadline breach on an external call.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Turn aborted by user interruption.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistantError>;
