//! Prompt formatting for on-device model architectures.
//!
//! Each supported architecture has a chat template mapping a message list
//! to a single prompt string, and a set of markers used to extract the
//! assistant span from raw model output. Unknown architectures use the
//! mistral template.

use crate::config::ModelArchitecture;
use crate::state::{ChatMessage, Role};

/// Chat template for one model family.
#[derive(Debug, Clone, Copy)]
pub struct ChatTemplate {
    system_prefix: &'static str,
    system_suffix: &'static str,
    user_prefix: &'static str,
    user_suffix: &'static str,
    assistant_prefix: &'static str,
    assistant_suffix: &'static str,
    default_system_prompt: &'static str,
    /// Markers that terminate the assistant span in raw output.
    stop_markers: &'static [&'static str],
}

const LLAMA2: ChatTemplate = ChatTemplate {
    system_prefix: "<s>[INST] <<SYS>>\n",
    system_suffix: "\n<</SYS>>\n\n",
    user_prefix: "",
    user_suffix: " [/INST]",
    assistant_prefix: " ",
    assistant_suffix: " </s><s>[INST] ",
    default_system_prompt: "You are a helpful, respectful and honest voice assistant. \
                            Answer as helpfully as possible while staying safe and concise.",
    stop_markers: &["</s>", "[INST]"],
};

const MISTRAL: ChatTemplate = ChatTemplate {
    system_prefix: "<s>[INST] ",
    system_suffix: "\n",
    user_prefix: "",
    user_suffix: " [/INST]",
    assistant_prefix: " ",
    assistant_suffix: " </s><s>[INST] ",
    default_system_prompt: "You are a helpful, respectful and precise assistant speaking \
                            with a user through voice. Keep a friendly conversational tone.",
    stop_markers: &["</s>", "[INST]"],
};

const VICUNA: ChatTemplate = ChatTemplate {
    system_prefix: "",
    system_suffix: "\n\n",
    user_prefix: "USER: ",
    user_suffix: "\n",
    assistant_prefix: "ASSISTANT: ",
    assistant_suffix: "\n\n",
    default_system_prompt: "You are a helpful AI assistant. Provide accurate, conversational \
                            answers to user questions.",
    stop_markers: &["USER:", "ASSISTANT:"],
};

const CHATML: ChatTemplate = ChatTemplate {
    system_prefix: "<|im_start|>system\n",
    system_suffix: "<|im_end|>\n",
    user_prefix: "<|im_start|>user\n",
    user_suffix: "<|im_end|>\n",
    assistant_prefix: "<|im_start|>assistant\n",
    assistant_suffix: "<|im_end|>\n",
    default_system_prompt: "You are a helpful, respectful, and honest assistant. Answer \
                            questions accurately and be helpful.",
    stop_markers: &["<|im_end|>", "<|im_start|>"],
};

/// Look up the template for an architecture.
pub fn template_for(architecture: ModelArchitecture) -> &'static ChatTemplate {
    match architecture {
        ModelArchitecture::Llama2 => &LLAMA2,
        ModelArchitecture::Mistral => &MISTRAL,
        ModelArchitecture::Vicuna => &VICUNA,
        ModelArchitecture::Chatml => &CHATML,
    }
}

/// Render a message list into a single prompt string.
///
/// The first system message (if any) fills the system slot; otherwise the
/// template's default system prompt is used. The prompt ends with the
/// assistant prefix so the model continues as the assistant.
pub fn format_prompt(messages: &[ChatMessage], architecture: ModelArchitecture) -> String {
    let template = template_for(architecture);
    let mut out = String::new();

    let system = messages.iter().find(|m| m.role == Role::System);
    out.push_str(template.system_prefix);
    out.push_str(
        system
            .map(|m| m.content.as_str())
            .unwrap_or(template.default_system_prompt),
    );
    out.push_str(template.system_suffix);

    for message in messages.iter().filter(|m| m.role != Role::System) {
        match message.role {
            Role::User => {
                out.push_str(template.user_prefix);
                out.push_str(&message.content);
                out.push_str(template.user_suffix);
            }
            Role::Assistant => {
                out.push_str(template.assistant_prefix);
                out.push_str(&message.content);
                out.push_str(template.assistant_suffix);
            }
            Role::System => {}
        }
    }

    out.push_str(template.assistant_prefix);
    out
}

/// Extract the assistant span from raw model output.
///
/// Cuts at the first stop marker for the architecture and trims template
/// whitespace.
pub fn extract_response(raw: &str, architecture: ModelArchitecture) -> String {
    let template = template_for(architecture);
    let mut span = raw;
    for marker in template.stop_markers {
        if let Some(idx) = span.find(marker) {
            span = &span[..idx];
        }
    }
    span.trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn msg(role: Role, content: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: content.to_owned(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn mistral_prompt_wraps_user_turn() {
        let messages = vec![msg(Role::User, "Hello there")];
        let prompt = format_prompt(&messages, ModelArchitecture::Mistral);
        assert!(prompt.starts_with("<s>[INST] "));
        assert!(prompt.contains("Hello there [/INST]"));
    }

    #[test]
    fn system_message_replaces_default() {
        let messages = vec![
            msg(Role::System, "You are a pirate."),
            msg(Role::User, "Hi"),
        ];
        let prompt = format_prompt(&messages, ModelArchitecture::Chatml);
        assert!(prompt.contains("<|im_start|>system\nYou are a pirate.<|im_end|>"));
        assert!(!prompt.contains("honest assistant"));
    }

    #[test]
    fn chatml_ends_with_assistant_prefix() {
        let messages = vec![msg(Role::User, "Hi")];
        let prompt = format_prompt(&messages, ModelArchitecture::Chatml);
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn vicuna_uses_role_labels() {
        let messages = vec![
            msg(Role::User, "What's up?"),
            msg(Role::Assistant, "Not much."),
            msg(Role::User, "Cool"),
        ];
        let prompt = format_prompt(&messages, ModelArchitecture::Vicuna);
        assert!(prompt.contains("USER: What's up?\n"));
        assert!(prompt.contains("ASSISTANT: Not much.\n\n"));
    }

    #[test]
    fn extract_cuts_at_stop_marker() {
        let raw = "Paris is the capital. </s><s>[INST] next";
        assert_eq!(
            extract_response(raw, ModelArchitecture::Mistral),
            "Paris is the capital."
        );
    }

    #[test]
    fn extract_cuts_at_role_label() {
        let raw = "The answer is 4.\nUSER: another question";
        assert_eq!(
            extract_response(raw, ModelArchitecture::Vicuna),
            "The answer is 4."
        );
    }

    #[test]
    fn extract_passes_clean_output_through() {
        assert_eq!(
            extract_response("  plain answer  ", ModelArchitecture::Chatml),
            "plain answer"
        );
    }
}
