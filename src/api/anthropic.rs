use super::{classify_error_payload, SseAction, UpstreamError};
use crate::models::{ChatMessage, Role};
use crate::resolver::ResolvedModel;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Serialize, Debug)]
struct AnthropicRequestBody<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<&'a ChatMessage>,
    stream: bool,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    ContentBlockDelta { delta: AnthropicDelta },
    MessageStop,
    Error { error: serde_json::Value },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

pub(super) fn build_request(
    client: &Client,
    base_url: &str,
    model: &ResolvedModel,
    messages: &[ChatMessage],
    max_output_tokens: u32,
) -> RequestBuilder {
    // System prompts travel outside the message list.
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let body = AnthropicRequestBody {
        model: model.model_id,
        max_tokens: max_output_tokens,
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        messages: messages.iter().filter(|m| m.role != Role::System).collect(),
        stream: true,
    };
    let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));
    client
        .post(url)
        .header("x-api-key", model.api_key())
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&body)
}

pub(super) fn parse_event(_event: &str, data: &str) -> Result<SseAction, UpstreamError> {
    if data.is_empty() {
        return Ok(SseAction::Skip);
    }
    let event: AnthropicEvent = serde_json::from_str(data)
        .map_err(|e| UpstreamError::Malformed(format!("{e}: {data}")))?;
    match event {
        AnthropicEvent::ContentBlockDelta {
            delta: AnthropicDelta::TextDelta { text },
        } => Ok(SseAction::Delta(text)),
        AnthropicEvent::MessageStop => Ok(SseAction::Done),
        AnthropicEvent::Error { error } => Err(classify_error_payload(&error)),
        _ => Ok(SseAction::Skip),
    }
}
