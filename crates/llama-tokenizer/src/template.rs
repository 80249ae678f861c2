//! Chat templates: the role delimiters a model architecture expects around
//! each turn of a conversation.

use serde::{Deserialize, Serialize};

/// Speaker of a context line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLine {
    pub role: Role,
    pub message: String,
}

impl ContextLine {
    pub fn new(role: Role, message: impl Into<String>) -> Self {
        Self {
            role,
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(Role::System, message)
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(Role::User, message)
    }

    pub fn assistant(message: impl Into<String>) -> Self {
        Self::new(Role::Assistant, message)
    }
}

/// Start/end delimiters for each role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTemplate {
    pub system_start: String,
    pub system_end: String,
    pub user_start: String,
    pub user_end: String,
    pub assistant_start: String,
    pub assistant_end: String,
}

impl ChatTemplate {
    fn from_parts(parts: [&str; 6]) -> Self {
        let [system_start, system_end, user_start, user_end, assistant_start, assistant_end] =
            parts;
        Self {
            system_start: system_start.to_string(),
            system_end: system_end.to_string(),
            user_start: user_start.to_string(),
            user_end: user_end.to_string(),
            assistant_start: assistant_start.to_string(),
            assistant_end: assistant_end.to_string(),
        }
    }

    /// Template for an architecture tag, or `None` if the tag is unknown.
    pub fn for_architecture(architecture: &str) -> Option<Self> {
        let parts = match architecture {
            "qwen2" => [
                "<|im_start|>system\n",
                "<|im_end|>\n",
                "<|im_start|>user\n",
                "<|im_end|>\n",
                "<|im_start|>assistant\n",
                "<|im_end|>\n",
            ],
            "phi3" => [
                "<|system|>\n",
                "<|end|>\n",
                "<|user|>\n",
                "<|end|>\n",
                "<|assistant|>\n",
                "<|end|>\n",
            ],
            "llama" => [
                "<|start_header_id|>system<|end_header_id|>\n",
                "<|eot_id|>\n",
                "<|start_header_id|>user<|end_header_id|>\n",
                "<|eot_id|>\n",
                "<|start_header_id|>assistant<|end_header_id|>\n",
                "<|eot_id|>\n",
            ],
            "gemma" | "gemma2" => [
                "<start_of_turn>system\n",
                "<end_of_turn>\n",
                "<start_of_turn>user\n",
                "<end_of_turn>\n",
                "<start_of_turn>model\n",
                "<end_of_turn>\n",
            ],
            "command-r" => [
                "<|START_OF_TURN_TOKEN|><|SYSTEM_TOKEN|>",
                "<|END_OF_TURN_TOKEN|>",
                "<|START_OF_TURN_TOKEN|><|USER_TOKEN|>",
                "<|END_OF_TURN_TOKEN|>",
                "<|START_OF_TURN_TOKEN|><|CHATBOT_TOKEN|>",
                "<|END_OF_TURN_TOKEN|>",
            ],
            "deepseek" => [
                "",
                "",
                "### Instruction: \n",
                "",
                "### Response:\n",
                "<|EOT|>\n",
            ],
            "vicuna" => ["SYSTEM:", "", "USER:", "", "ASSISTANT:", "</s>\n"],
            "zephyr" => [
                "<|system|>\n",
                "<|endoftext|>\n",
                "<|user|>\n",
                "<|endoftext|>\n",
                "<|assistant|>\n",
                "<|endoftext|>\n",
            ],
            "openchat" => [
                "<s>GPT4 Correct System: ",
                "<|end_of_turn|>",
                "GPT4 Correct User: ",
                "<|end_of_turn|>",
                "GPT4 Correct Assistant: ",
                "<|end_of_turn|>",
            ],
            "monarch" => [
                "<s>system\n",
                "</s>\n",
                "<s>user\n",
                "</s>\n",
                "<s>assistant\n",
                "</s>\n",
            ],
            "orion" => [
                "System: </s>\n",
                "</s>\n",
                "</s>Human:\n",
                "</s>\n",
                "Assistant: </s>\n",
                "</s>\n",
            ],
            _ => return None,
        };
        Some(Self::from_parts(parts))
    }

    /// Template without delimiters: messages are concatenated as-is.
    pub fn plain() -> Self {
        Self::from_parts([""; 6])
    }

    pub fn delimiters(&self, role: Role) -> (&str, &str) {
        match role {
            Role::System => (&self.system_start, &self.system_end),
            Role::User => (&self.user_start, &self.user_end),
            Role::Assistant => (&self.assistant_start, &self.assistant_end),
        }
    }

    /// Wrap each line in its role delimiters and concatenate. When the last
    /// line is a user turn and `append_assistant` is set, the assistant start
    /// delimiter is appended so the model answers next.
    pub fn render(&self, lines: &[ContextLine], append_assistant: bool) -> String {
        let mut out = String::new();
        for line in lines {
            let (start, end) = self.delimiters(line.role);
            out.push_str(start);
            out.push_str(&line.message);
            out.push_str(end);
        }
        let ends_with_user = lines.last().is_some_and(|l| l.role == Role::User);
        if append_assistant && ends_with_user {
            out.push_str(&self.assistant_start);
        }
        out
    }

    /// Every distinct non-empty delimiter, for registering as control tokens.
    pub fn control_strings(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for s in [
            &self.system_start,
            &self.system_end,
            &self.user_start,
            &self.user_end,
            &self.assistant_start,
            &self.assistant_end,
        ] {
            let trimmed = s.trim_end_matches('\n');
            if !trimmed.is_empty() && !out.iter().any(|o| o == trimmed) {
                out.push(trimmed.to_string());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qwen_render_appends_assistant_after_user() {
        let template = ChatTemplate::for_architecture("qwen2").unwrap();
        let lines = [ContextLine::system("be brief"), ContextLine::user("hi")];
        assert_eq!(
            template.render(&lines, true),
            "<|im_start|>system\nbe brief<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn no_assistant_suffix_after_assistant_turn() {
        let template = ChatTemplate::for_architecture("phi3").unwrap();
        let lines = [ContextLine::user("q"), ContextLine::assistant("a")];
        let rendered = template.render(&lines, true);
        assert!(rendered.ends_with("a<|end|>\n"));
    }

    #[test]
    fn no_assistant_suffix_when_not_requested() {
        let template = ChatTemplate::for_architecture("llama").unwrap();
        let rendered = template.render(&[ContextLine::user("q")], false);
        assert!(rendered.ends_with("<|eot_id|>\n"));
    }

    #[test]
    fn gemma_aliases_share_template() {
        assert_eq!(
            ChatTemplate::for_architecture("gemma"),
            ChatTemplate::for_architecture("gemma2")
        );
        let t = ChatTemplate::for_architecture("gemma").unwrap();
        assert_eq!(t.assistant_start, "<start_of_turn>model\n");
    }

    #[test]
    fn unknown_architecture_has_no_template() {
        assert!(ChatTemplate::for_architecture("mamba").is_none());
        let plain = ChatTemplate::plain();
        assert_eq!(plain.render(&[ContextLine::user("x")], true), "x");
    }

    #[test]
    fn control_strings_are_distinct_and_trimmed() {
        let t = ChatTemplate::for_architecture("qwen2").unwrap();
        assert_eq!(
            t.control_strings(),
            vec![
                "<|im_start|>system",
                "<|im_end|>",
                "<|im_start|>user",
                "<|im_start|>assistant"
            ]
        );
    }

    #[test]
    fn role_serde_is_lowercase() {
        let line: ContextLine =
            serde_json::from_str(r#"{"role":"assistant","message":"ok"}"#).unwrap();
        assert_eq!(line, ContextLine::assistant("ok"));
    }
}
