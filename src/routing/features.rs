//! Lexical feature extraction for query routing.
//!
//! Scores are heuristic and intentionally cheap: routing must stay well
//! under the per-query latency budget, so everything here is a single
//! pass over lowercased words.

use crate::config::RouterWeights;
use std::collections::BTreeMap;

/// Cues that suggest a creative-writing request.
const CREATIVE_CUES: &[&str] = &[
    "write", "story", "imagine", "poem", "compose", "invent", "creative", "fiction", "song",
    "essay", "brainstorm", "lyrics",
];

/// Cues that suggest the user wants a fast, short answer.
const TIME_CUES: &[&str] = &[
    "quick", "quickly", "now", "briefly", "fast", "hurry", "asap", "short", "immediately",
];

/// Connectives and verbs that indicate a multi-part or analytical ask.
const STRUCTURE_CUES: &[&str] = &[
    "and", "then", "also", "compare", "contrast", "analyze", "analyse", "explain", "evaluate",
    "implications", "because", "although", "whereas", "versus", "pros", "cons",
];

/// References to earlier conversation.
const CONTEXT_CUES: &[&str] = &[
    "it", "that", "those", "this", "they", "previous", "earlier", "before", "again", "above",
    "last",
];

/// Interrogative openers.
const QUESTION_OPENERS: &[&str] = &[
    "what", "who", "when", "where", "why", "how", "is", "are", "can", "do", "does", "did",
    "will", "would", "could", "should",
];

/// Imperative openers.
const COMMAND_OPENERS: &[&str] = &[
    "tell", "show", "give", "list", "find", "play", "set", "turn", "open", "stop", "start",
    "remind", "call", "send",
];

/// Word count used to normalize the length score.
const LENGTH_NORM_WORDS: f32 = 60.0;

/// Feature scores extracted from one query, each in [0, 1] except
/// `word_count`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFeatures {
    /// Raw whitespace-delimited word count.
    pub word_count: usize,
    /// Word count normalized against [`LENGTH_NORM_WORDS`].
    pub length_score: f32,
    /// Whether the query reads as a question.
    pub is_question: bool,
    /// Whether the query reads as an imperative.
    pub is_command: bool,
    /// Creative-writing cue density.
    pub creative_cues: f32,
    /// Open-ended question score ("what if", "how would", "imagine").
    pub open_question: f32,
    /// Multi-part / analytical structure score.
    pub structure: f32,
    /// Urgency cue score.
    pub time_sensitivity: f32,
    /// Prior-turn reference score (zero without history).
    pub context_dependence: f32,
}

impl QueryFeatures {
    /// Extract features from a trimmed, non-empty query.
    pub fn extract(query: &str, has_history: bool) -> Self {
        let lowered = query.to_lowercase();
        let words: Vec<&str> = lowered
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| !w.is_empty())
            .collect();
        let word_count = lowered.split_whitespace().count();

        let count_hits = |cues: &[&str]| words.iter().filter(|w| cues.contains(*w)).count();

        let first = words.first().copied().unwrap_or("");
        let is_question = query.trim_end().ends_with('?') || QUESTION_OPENERS.contains(&first);
        let is_command = COMMAND_OPENERS.contains(&first);

        let creative_hits = count_hits(CREATIVE_CUES);
        let structure_hits = count_hits(STRUCTURE_CUES);
        let time_hits = count_hits(TIME_CUES);
        let context_hits = if has_history {
            count_hits(CONTEXT_CUES)
        } else {
            0
        };

        // Commas and semicolons approximate clause nesting.
        let clause_breaks = query.chars().filter(|c| matches!(c, ',' | ';')).count();

        let open_question = if lowered.starts_with("what if")
            || lowered.starts_with("how would")
            || lowered.starts_with("imagine")
        {
            1.0
        } else if is_question && word_count > 10 {
            0.4
        } else {
            0.0
        };

        Self {
            word_count,
            length_score: (word_count as f32 / LENGTH_NORM_WORDS).min(1.0),
            is_question,
            is_command,
            creative_cues: saturate(creative_hits, 2),
            open_question,
            structure: saturate(structure_hits + clause_breaks, 4),
            time_sensitivity: saturate(time_hits, 2),
            context_dependence: saturate(context_hits, 3),
        }
    }

    /// Weighted complexity score in [0, 1].
    pub fn complexity(&self, weights: &RouterWeights) -> f32 {
        let sum = weights.length + weights.structure + weights.context_dependence;
        if sum <= 0.0 {
            return 0.0;
        }
        let raw = weights.length * self.length_score
            + weights.structure * self.structure
            + weights.context_dependence * self.context_dependence;
        (raw / sum).clamp(0.0, 1.0)
    }

    /// Weighted creativity score in [0, 1].
    pub fn creativity(&self, weights: &RouterWeights) -> f32 {
        let sum = weights.creative_cues + weights.open_question;
        if sum <= 0.0 {
            return 0.0;
        }
        let raw = weights.creative_cues * self.creative_cues
            + weights.open_question * self.open_question;
        (raw / sum).clamp(0.0, 1.0)
    }

    /// Feature scores keyed by name, for the routing decision record.
    pub fn as_map(&self) -> BTreeMap<String, f32> {
        let mut map = BTreeMap::new();
        map.insert("length".to_owned(), self.length_score);
        map.insert("question".to_owned(), if self.is_question { 1.0 } else { 0.0 });
        map.insert("command".to_owned(), if self.is_command { 1.0 } else { 0.0 });
        map.insert("creative_cues".to_owned(), self.creative_cues);
        map.insert("open_question".to_owned(), self.open_question);
        map.insert("structure".to_owned(), self.structure);
        map.insert("time_sensitivity".to_owned(), self.time_sensitivity);
        map.insert("context_dependence".to_owned(), self.context_dependence);
        map
    }
}

/// Map a hit count to [0, 1], saturating at `full`.
fn saturate(hits: usize, full: usize) -> f32 {
    if full == 0 {
        return 0.0;
    }
    (hits as f32 / full as f32).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_is_low_everything() {
        let f = QueryFeatures::extract("Hi", false);
        assert_eq!(f.word_count, 1);
        assert!(f.length_score < 0.05);
        assert_eq!(f.creative_cues, 0.0);
        assert_eq!(f.structure, 0.0);
        assert_eq!(f.time_sensitivity, 0.0);
    }

    #[test]
    fn detects_questions_and_commands() {
        assert!(QueryFeatures::extract("What is the capital of France?", false).is_question);
        assert!(QueryFeatures::extract("how tall is that mountain", false).is_question);
        assert!(QueryFeatures::extract("Tell me a joke", false).is_command);
    }

    #[test]
    fn creative_cues_score() {
        let f = QueryFeatures::extract("Write a story about a lighthouse", false);
        assert!(f.creative_cues >= 1.0);
    }

    #[test]
    fn time_cues_score() {
        let f = QueryFeatures::extract("quick, what's the weather now", false);
        assert!(f.time_sensitivity >= 0.5);
    }

    #[test]
    fn context_cues_need_history() {
        let q = "what did you say about that earlier";
        assert_eq!(QueryFeatures::extract(q, false).context_dependence, 0.0);
        assert!(QueryFeatures::extract(q, true).context_dependence > 0.0);
    }

    #[test]
    fn structure_counts_clauses() {
        let f = QueryFeatures::extract(
            "Compare solar and wind power, then explain which is cheaper, and evaluate why",
            false,
        );
        assert!(f.structure >= 0.9);
    }

    #[test]
    fn punctuation_stripped_for_cue_matching() {
        let f = QueryFeatures::extract("Briefly, explain photosynthesis", false);
        assert!(f.time_sensitivity > 0.0);
    }
}
