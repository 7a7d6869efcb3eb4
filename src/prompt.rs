//! Llama-2 chat prompt template.

use crate::messages::{Message, Role};

const BOS: &str = "<s>";
const EOS: &str = "</s>";

/// Renders messages into a single `[INST]`-tagged prompt.
///
/// A system block opens the first instruction and leaves it open so the next
/// user turn lands inside it. Every user turn is wrapped in its own
/// `[INST] .. [/INST]` pair, and an assistant turn closes the span with `</s>`.
/// Roles outside the canonical set contribute nothing.
pub fn render_prompt(messages: &[Message]) -> String {
    let mut prompt = String::new();

    for message in messages {
        let content = &message.content;
        match message.role {
            Role::System => {
                prompt.push_str(&format!("{BOS}[INST] <<SYS>>\n{content}\n<</SYS>>\n\n"));
            }
            Role::User => {
                if prompt.is_empty() {
                    prompt.push_str(BOS);
                }
                prompt.push_str(&format!("[INST] {content} [/INST]"));
            }
            Role::Assistant => {
                prompt.push_str(&format!(" {content} {EOS}"));
            }
            Role::Other(ref role) => {
                tracing::trace!(role = %role, "Skipping non-canonical role in prompt");
            }
        }
    }

    prompt
}
