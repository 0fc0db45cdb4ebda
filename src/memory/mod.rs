//! Conversation memory: the engine interface and retrieval helpers.
//!
//! The concrete memory engine (vector store, on-disk conversation
//! store) lives outside this crate. The core talks to it through
//! [`MemoryEngine`], started at boot and shut down last during exit.
//! The memory graph nodes catch every engine failure and degrade to a
//! memory-less turn.

use crate::error::Result;
use crate::state::{ExchangePair, MemorySnippet, RetrievedContext};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// One completed user/assistant exchange handed to the engine.
#[derive(Debug, Clone)]
pub struct Interaction {
    /// The user's utterance.
    pub user_message: String,
    /// The assistant's reply.
    pub assistant_message: String,
    /// Free-form metadata stored alongside the pair.
    pub metadata: Map<String, Value>,
}

/// Interface to the external memory engine.
///
/// All operations are async and may fail; callers in the graph catch
/// failures and write status strings instead of raising. The engine is
/// a process-wide service: `initialize` runs once at boot, `shutdown`
/// once at exit.
#[async_trait]
pub trait MemoryEngine: Send + Sync {
    /// Prepare backing stores. Called once at boot.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Flush and close backing stores. Called once at shutdown.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Top-K semantically similar snippets for a query.
    async fn retrieve_context(&self, query: &str, max_results: usize)
    -> Result<Vec<MemorySnippet>>;

    /// Top-K prior-conversation snippets for a query.
    async fn retrieve_conversations(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<MemorySnippet>>;

    /// Persist a completed exchange.
    async fn store_interaction(&self, interaction: &Interaction) -> Result<()>;

    /// Add or refresh embeddings for a piece of text.
    async fn update_embeddings(&self, text: &str, metadata: &Map<String, Value>) -> Result<()>;

    /// Produce a summary of a span of rolling history.
    async fn generate_summary(&self, history: &[ExchangePair]) -> Result<String>;

    /// Move old conversations to cold storage.
    async fn archive_conversations(&self, conversation_ids: &[String]) -> Result<()>;
}

/// Rough token count used to budget retrieved context (4 chars/token).
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Assemble retrieval results into turn context, trimming to the token
/// budget (semantic snippets are dropped first, lowest score first).
pub fn build_context(
    conversation_snippets: Vec<MemorySnippet>,
    mut semantic_snippets: Vec<MemorySnippet>,
    token_cap: usize,
) -> RetrievedContext {
    semantic_snippets.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut budget: usize = token_cap;
    let mut kept_conversation = Vec::new();
    for snippet in conversation_snippets {
        let cost = estimate_tokens(&snippet.content);
        if cost > budget {
            break;
        }
        budget -= cost;
        kept_conversation.push(snippet);
    }
    let mut kept_semantic = Vec::new();
    for snippet in semantic_snippets {
        let cost = estimate_tokens(&snippet.content);
        if cost > budget {
            break;
        }
        budget -= cost;
        kept_semantic.push(snippet);
    }

    let token_estimate = token_cap - budget;
    RetrievedContext {
        conversation_snippets: kept_conversation,
        semantic_snippets: kept_semantic,
        user_preferences: Map::new(),
        recent_topics: Vec::new(),
        token_estimate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet(id: &str, content: &str, score: f32) -> MemorySnippet {
        MemorySnippet {
            id: id.to_owned(),
            content: content.to_owned(),
            score,
            metadata: Map::new(),
        }
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn context_respects_token_budget() {
        let conversation = vec![snippet("c1", &"x".repeat(40), 0.9)];
        let semantic = vec![
            snippet("s1", &"y".repeat(40), 0.8),
            snippet("s2", &"z".repeat(400), 0.7),
        ];
        let context = build_context(conversation, semantic, 25);
        assert_eq!(context.conversation_snippets.len(), 1);
        assert_eq!(context.semantic_snippets.len(), 1);
        assert!(context.token_estimate <= 25);
    }

    #[test]
    fn semantic_snippets_kept_by_score() {
        let semantic = vec![
            snippet("low", &"a".repeat(40), 0.1),
            snippet("high", &"b".repeat(40), 0.9),
        ];
        let context = build_context(Vec::new(), semantic, 10);
        assert_eq!(context.semantic_snippets.len(), 1);
        assert_eq!(context.semantic_snippets[0].id, "high");
    }
}
