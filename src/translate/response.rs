use super::anthropic_types::{MessagesResponse, ResponseContentBlock};
use super::openai_types::{ChatCompletionResponse, ChatUsage, Choice, ChoiceMessage, FinishReason};

/// Translate an Anthropic Messages response into an `OpenAI` Chat Completion response.
/// Pure apart from `created`, which is stamped with the current time.
pub fn anthropic_to_openai(resp: &MessagesResponse) -> ChatCompletionResponse {
    let content = resp.content.iter().map(render_block).collect::<String>();

    ChatCompletionResponse {
        id: resp.id.clone(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content,
            },
            finish_reason: map_stop_reason(resp.stop_reason.as_deref()),
        }],
        usage: ChatUsage::new(resp.usage.input_tokens, resp.usage.output_tokens),
    }
}

/// Flatten one result block into assistant text.
/// Tool calls have no place in the chat text, so they are rendered inline.
pub fn render_block(block: &ResponseContentBlock) -> String {
    match block {
        ResponseContentBlock::Text { text } => text.clone(),
        ResponseContentBlock::ToolUse { name, input, .. } => {
            format!("{}{}\n", tool_use_header(name), input)
        }
        ResponseContentBlock::Other => String::new(),
    }
}

/// Prefix written before a tool call's serialized input.
pub fn tool_use_header(name: &str) -> String {
    format!("Tool used: {name}\nInput: ")
}

/// Map Anthropic stop_reason to `OpenAI` finish_reason
pub fn map_stop_reason(reason: Option<&str>) -> Option<FinishReason> {
    let reason = reason?;
    Some(match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        // pause_turn and anything newer still ends the turn
        _ => FinishReason::Stop,
    })
}
