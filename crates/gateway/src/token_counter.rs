//! Token estimates for usage reporting. The backend reports no token counts,
//! so both prompt and completion are counted locally with `cl100k_base`.

use serde_json::json;
use tiktoken_rs::CoreBPE;

use crate::messages::unified::{UnifiedContent, UnifiedRequest};

const TOKENS_PER_MESSAGE: u32 = 4;
const TOKENS_PER_IMAGE: u32 = 85;
/// Every reply is primed with the assistant role.
const REPLY_PRIMING: u32 = 3;

fn bpe() -> &'static CoreBPE {
    tiktoken_rs::cl100k_base_singleton()
}

/// Loads the tokenizer outside the request path.
pub(crate) fn preload() {
    let _ = bpe();
}

pub(crate) fn count_text(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    u32::try_from(bpe().encode_with_special_tokens(text).len()).unwrap_or(u32::MAX)
}

/// Prompt tokens of a request as the client sent it.
pub(crate) fn count_request(request: &UnifiedRequest) -> u32 {
    let mut tokens = REPLY_PRIMING;

    for message in &request.messages {
        tokens += TOKENS_PER_MESSAGE;

        for block in &message.content {
            tokens += match block {
                UnifiedContent::Text { text } => count_text(text),
                UnifiedContent::Image { .. } => TOKENS_PER_IMAGE,
                UnifiedContent::ToolUse { name, input, .. } => count_text(name) + count_text(&input.to_string()),
                UnifiedContent::ToolResult { content, .. } => count_text(content),
            };
        }
    }

    for tool in &request.tools {
        let definition = json!({
            "name": tool.function.name,
            "description": tool.function.description,
            "parameters": tool.function.parameters,
        });

        tokens += count_text(&definition.to_string());
    }

    tokens
}
