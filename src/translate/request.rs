//! Translate `OpenAI` Chat Completions requests into Anthropic Messages requests.
//!
//! Unsupported features (function calling, tools, function-role messages,
//! `frequency_penalty`, `logit_bias`) are rejected up front rather than
//! approximated. System messages are hoisted into the top-level `system`
//! field and `image_url` parts become Anthropic `image` blocks.

use super::anthropic_types::{
    ContentBlock, ImageSource, ImageSourceType, Message, MessageContent, MessagesRequest, Metadata,
    Role,
};
use super::openai_types::{ChatCompletionRequest, ChatContent, ChatMessage, ChatRole, ContentPart};
use crate::error::UnsupportedFeature;

/// `top_k` sent upstream when the client gave no `presence_penalty`.
pub const DEFAULT_TOP_K: u64 = 40;

/// Media type used for remote images whose URL carries no usable extension.
const FALLBACK_IMAGE_MEDIA_TYPE: &str = "image/jpeg";

/// Translate an `OpenAI` Chat Completions request into an Anthropic Messages request.
/// Pure function: the model id and all sampling values pass through untouched.
///
/// # Errors
/// Returns the first [`UnsupportedFeature`] found in the request.
pub fn openai_to_anthropic(
    req: &ChatCompletionRequest,
) -> Result<MessagesRequest, UnsupportedFeature> {
    check_supported(req)?;

    let system_parts: Vec<String> = req
        .messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_ref().map(ChatContent::as_text).unwrap_or_default())
        .collect();
    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };

    let messages = req
        .messages
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .map(translate_message)
        .collect();

    // presence_penalty and top_k live on different scales; the raw value goes through as-is
    let top_k = match req.presence_penalty.clone() {
        Some(penalty) => {
            tracing::debug!(%penalty, "forwarding presence_penalty as top_k");
            penalty
        }
        None => DEFAULT_TOP_K.into(),
    };

    Ok(MessagesRequest {
        model: req.model.clone(),
        messages,
        system,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: Some(top_k),
        stop_sequences: req.stop.clone().map(|s| s.into_vec()).unwrap_or_default(),
        metadata: req.user.as_ref().map(|user| Metadata {
            user_id: Some(user.clone()),
        }),
        stream: req.stream,
    })
}

/// Reject anything the Messages API cannot express faithfully.
/// Checks run in a fixed order and the first hit wins.
pub fn check_supported(req: &ChatCompletionRequest) -> Result<(), UnsupportedFeature> {
    if req.function_call.is_some()
        || req.functions.is_some()
        || req.tools.is_some()
        || req.tool_choice.is_some()
    {
        return Err(UnsupportedFeature::FunctionCalling);
    }

    if req
        .messages
        .iter()
        .any(|m| matches!(m.role, ChatRole::Function | ChatRole::Tool))
    {
        return Err(UnsupportedFeature::FunctionMessages);
    }

    if req.frequency_penalty.is_some() {
        return Err(UnsupportedFeature::FrequencyPenalty);
    }

    if req.logit_bias.is_some() {
        return Err(UnsupportedFeature::LogitBias);
    }

    Ok(())
}

fn translate_message(msg: &ChatMessage) -> Message {
    let role = match msg.role {
        ChatRole::Assistant => Role::Assistant,
        _ => Role::User,
    };

    let content = match &msg.content {
        None => MessageContent::Text(String::new()),
        Some(ChatContent::Text(text)) => MessageContent::Text(text.clone()),
        Some(ChatContent::Parts(parts)) => {
            MessageContent::Blocks(parts.iter().map(translate_part).collect())
        }
    };

    Message { role, content }
}

fn translate_part(part: &ContentPart) -> ContentBlock {
    match part {
        ContentPart::Text { text } => ContentBlock::Text { text: text.clone() },
        ContentPart::ImageUrl { image_url } => ContentBlock::Image {
            source: image_source(&image_url.url),
        },
    }
}

/// Inline `data:` URLs become base64 sources; anything else is referenced by URL.
fn image_source(url: &str) -> ImageSource {
    match parse_data_url(url) {
        Some((media_type, data)) => ImageSource {
            source_type: ImageSourceType::Base64,
            media_type: media_type.to_string(),
            data: data.to_string(),
        },
        None => ImageSource {
            source_type: ImageSourceType::Url,
            media_type: media_type_from_extension(url),
            data: url.to_string(),
        },
    }
}

/// Split `data:<mime>[;param=value]*;base64,<payload>` into its media type and payload.
pub(crate) fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let raw = url.strip_prefix("data:")?;
    let (meta, data) = raw.split_once(',')?;
    let (media_type, params) = meta.split_once(';')?;
    let encoding = params.rsplit(';').next()?;
    if !encoding.eq_ignore_ascii_case("base64") || media_type.is_empty() {
        return None;
    }
    Some((media_type, data))
}

/// `https://host/a/photo.PNG?x=1` -> `image/png`
fn media_type_from_extension(url: &str) -> String {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = without_scheme.split(['?', '#']).next().unwrap_or("");

    let extension = path
        .split_once('/')
        .and_then(|(_, p)| p.rsplit('/').next())
        .and_then(|file_name| file_name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));

    match extension {
        Some(ext) => format!("image/{}", ext.to_ascii_lowercase()),
        None => FALLBACK_IMAGE_MEDIA_TYPE.to_string(),
    }
}
