use super::{classify_error_payload, SseAction, UpstreamError};
use crate::models::{ChatMessage, Role};
use crate::resolver::ResolvedModel;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiRequestBody<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Debug)]
struct GeminiContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize, Debug)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Deserialize, Debug)]
struct GeminiChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize, Debug)]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
}

#[derive(Deserialize, Debug)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiCandidatePart>,
}

#[derive(Deserialize, Debug)]
struct GeminiCandidatePart {
    text: Option<String>,
}

pub(super) fn build_request(
    client: &Client,
    base_url: &str,
    model: &ResolvedModel,
    messages: &[ChatMessage],
    max_output_tokens: u32,
) -> RequestBuilder {
    let system_parts: Vec<GeminiPart<'_>> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| GeminiPart { text: &m.content })
        .collect();
    let contents = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| GeminiContent {
            role: Some(if m.role == Role::Assistant { "model" } else { "user" }),
            parts: vec![GeminiPart { text: &m.content }],
        })
        .collect();

    let body = GeminiRequestBody {
        contents,
        system_instruction: (!system_parts.is_empty()).then_some(GeminiContent {
            role: None,
            parts: system_parts,
        }),
        generation_config: GenerationConfig { max_output_tokens },
    };
    let url = format!(
        "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
        base_url.trim_end_matches('/'),
        model.model_id
    );
    client
        .post(url)
        .header("x-goog-api-key", model.api_key())
        .json(&body)
}

pub(super) fn parse_event(_event: &str, data: &str) -> Result<SseAction, UpstreamError> {
    if data.is_empty() {
        return Ok(SseAction::Skip);
    }
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| UpstreamError::Malformed(format!("{e}: {data}")))?;
    if let Some(error) = value.get("error") {
        return Err(classify_error_payload(error));
    }

    let chunk: GeminiChunk = serde_json::from_value(value)
        .map_err(|e| UpstreamError::Malformed(format!("{e}: {data}")))?;
    let text: String = chunk
        .candidates
        .into_iter()
        .take(1)
        .filter_map(|candidate| candidate.content)
        .flat_map(|content| content.parts)
        .filter_map(|part| part.text)
        .collect();
    Ok(if text.is_empty() {
        SseAction::Skip
    } else {
        SseAction::Delta(text)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_parts_of_first_candidate() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]}},{"content":{"parts":[{"text":"z"}]}}]}"#;
        assert_eq!(parse_event("", data).unwrap(), SseAction::Delta("ab".into()));
    }

    #[test]
    fn finish_only_chunk_is_skipped() {
        let data = r#"{"candidates":[{"finishReason":"STOP"}],"usageMetadata":{"totalTokenCount":9}}"#;
        assert_eq!(parse_event("", data).unwrap(), SseAction::Skip);
    }

    #[test]
    fn resource_exhausted_is_rate_limit() {
        let data = r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#;
        assert!(parse_event("", data).unwrap_err().is_rate_limit());
    }
}
