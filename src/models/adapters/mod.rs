// Model family adapters
//
// Each adapter knows one family's prompt template and how to tidy the text a
// model emits. The fine-tuning corpus and the inference engine format prompts
// through the same adapter; the candle generator cleans output with it.

mod granite;

pub use granite::GraniteEsgAdapter;

/// Prompt template and output cleanup for one model family
pub trait LocalModelAdapter: Send + Sync {
    /// Render a system message and one user turn, ending where the assistant
    /// is expected to start
    fn format_chat_prompt(&self, system: &str, user_message: &str) -> String;

    /// Token text that terminates an assistant turn
    fn eos_token(&self) -> &str;

    /// Strip template markers the model may echo back
    fn clean_output(&self, raw_output: &str) -> String;
}
