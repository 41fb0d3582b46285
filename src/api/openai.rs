use super::{classify_error_payload, SseAction, UpstreamError};
use crate::models::ChatMessage;
use crate::resolver::ResolvedModel;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Debug)]
struct OpenAIRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    stream: bool,
}

// Response structure for STREAMING chunks
#[derive(Deserialize, Debug)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamDelta {
    content: Option<String>,
}

pub(super) fn build_request(
    client: &Client,
    base_url: &str,
    model: &ResolvedModel,
    messages: &[ChatMessage],
    max_output_tokens: u32,
) -> RequestBuilder {
    let body = OpenAIRequestBody {
        model: model.model_id,
        messages,
        max_tokens: max_output_tokens,
        stream: true,
    };
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    client.post(url).bearer_auth(model.api_key()).json(&body)
}

pub(super) fn parse_event(_event: &str, data: &str) -> Result<SseAction, UpstreamError> {
    // Check for the special [DONE] message
    if data == "[DONE]" {
        log::debug!("OpenAI stream finished with [DONE]");
        return Ok(SseAction::Done);
    }
    if data.is_empty() {
        return Ok(SseAction::Skip);
    }

    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| UpstreamError::Malformed(format!("{e}: {data}")))?;
    if let Some(error) = value.get("error") {
        return Err(classify_error_payload(error));
    }

    let chunk: OpenAIStreamChunk = serde_json::from_value(value)
        .map_err(|e| UpstreamError::Malformed(format!("{e}: {data}")))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .map_or(SseAction::Skip, SseAction::Delta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_delta() {
        let action = parse_event("", r#"{"choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":null}]}"#);
        assert_eq!(action.unwrap(), SseAction::Delta("hi".into()));
    }

    #[test]
    fn role_only_delta_is_skipped() {
        let action = parse_event("", r#"{"choices":[{"delta":{"role":"assistant"}}]}"#);
        assert_eq!(action.unwrap(), SseAction::Skip);
    }

    #[test]
    fn usage_chunk_without_choices_is_skipped() {
        let action = parse_event("", r#"{"choices":[],"usage":{"total_tokens":3}}"#);
        assert_eq!(action.unwrap(), SseAction::Skip);
    }

    #[test]
    fn done_marker() {
        assert_eq!(parse_event("", "[DONE]").unwrap(), SseAction::Done);
    }

    #[test]
    fn error_event_with_rate_limit_code() {
        let err = parse_event(
            "",
            r#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#,
        )
        .unwrap_err();
        assert!(err.is_rate_limit());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(parse_event("", "{not json"), Err(UpstreamError::Malformed(_))));
    }
}
