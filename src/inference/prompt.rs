//! Conversation to prompt conversion

use crate::types::Message;

/// Line that hands the turn to the model
pub const ASSISTANT_CUE: &str = "assistant:";

/// Flattens a conversation into a single prompt.
///
/// Each message becomes a `"<role>: <content>"` line, in order, and the
/// prompt always ends with an `assistant:` line.
pub fn build_prompt(messages: &[Message]) -> String {
    let mut lines: Vec<String> = messages
        .iter()
        .map(|message| format!("{}: {}", message.role, message.content))
        .collect();
    lines.push(ASSISTANT_CUE.to_string());
    lines.join("\n")
}
