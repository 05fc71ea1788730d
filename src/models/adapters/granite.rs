// Granite ESG adapter
//
// Plain-marker chat format used by the ESG fine-tune:
//   <|system|>{system}<|user|>\n{user}<|assistant|>\n

use super::LocalModelAdapter;
use crate::config::constants::*;

/// Adapter for Granite checkpoints tuned on the ESG corpus
#[derive(Debug, Clone, Copy, Default)]
pub struct GraniteEsgAdapter;

impl GraniteEsgAdapter {
    /// Prompt for an instruction followed by its input lines, using the ESG
    /// system prompt
    pub fn format_instruction(&self, instruction: &str, input: &str) -> String {
        let user = if input.is_empty() {
            instruction.to_string()
        } else {
            format!("{}\n{}", instruction, input)
        };
        self.format_chat_prompt(ESG_SYSTEM_PROMPT, &user)
    }

    /// Full training text: prompt, target answer and end-of-text marker
    pub fn format_training_text(&self, instruction: &str, input: &str, output: &str) -> String {
        format!(
            "{}{}{}",
            self.format_instruction(instruction, input),
            output,
            self.eos_token()
        )
    }
}

impl LocalModelAdapter for GraniteEsgAdapter {
    fn format_chat_prompt(&self, system: &str, user_message: &str) -> String {
        format!(
            "{}{}{}\n{}{}\n",
            SYSTEM_MARKER, system, USER_MARKER, user_message, ASSISTANT_MARKER
        )
    }

    fn eos_token(&self) -> &str {
        END_OF_TEXT
    }

    fn clean_output(&self, raw_output: &str) -> String {
        let mut cleaned = raw_output;

        // Echoed prompt: keep only what follows the last assistant marker
        if let Some(pos) = cleaned.rfind(ASSISTANT_MARKER) {
            cleaned = &cleaned[pos + ASSISTANT_MARKER.len()..];
        }

        // A new turn or end marker ends the answer
        for marker in [END_OF_TEXT, USER_MARKER, SYSTEM_MARKER] {
            if let Some(pos) = cleaned.find(marker) {
                cleaned = &cleaned[..pos];
            }
        }

        cleaned.trim().to_string()
    }
}
