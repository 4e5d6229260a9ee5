//! LLM provider client
//!
//! OpenAI-compatible chat completions: one `Complete` capability, request
//! built from the routed profile, response content plus usage counts. HTTP
//! errors keep the status and the (truncated) JSON body for the run journal.

use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sv_common::models::LlmParams;
use sv_common::{Error, Result};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
}

/// A completed chat call.
#[derive(Debug)]
pub struct Completion {
    pub content: String,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

/// Issue one chat-completion request against an OpenAI-compatible endpoint.
pub async fn complete(
    base_url: Option<&str>,
    api_key: Option<&str>,
    model_name: &str,
    messages: &[ChatMessage],
    params: &LlmParams,
    timeout_seconds: u64,
) -> Result<Completion> {
    let base = base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/');
    let url = format!("{base}/chat/completions");
    let request = ChatRequest {
        model: model_name,
        messages,
        temperature: params.temperature,
        max_tokens: params.max_tokens,
        top_p: params.top_p,
        seed: params.seed,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds.max(1)))
        .build()
        .map_err(|e| Error::Internal(format!("HTTP client construction failed: {e}")))?;

    let mut builder = client.post(&url).json(&request);
    if let Some(key) = api_key {
        builder = builder.bearer_auth(key);
    }
    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            Error::Transient(format!("LLM request timeout: {e}"))
        } else {
            Error::Transient(format!("LLM request failed: {e}"))
        }
    })?;

    let status = response.status().as_u16();
    if !response.status().is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        let mut err = Error::from_http_status(status, truncate(&body, 1024));
        if let Error::RateLimited {
            retry_after_seconds,
            ..
        } = &mut err
        {
            *retry_after_seconds = retry_after;
        }
        return Err(err);
    }

    let parsed: ChatResponse = response
        .json()
        .await
        .map_err(|e| Error::Permanent(format!("LLM response parse failed: {e}")))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| Error::Permanent("LLM response had no content".to_string()))?;
    let usage = parsed.usage.unwrap_or_default();
    Ok(Completion {
        content,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
    })
}

/// Render a prompt pair, substituting `{{input}}` in both templates.
pub fn render_messages(
    system_template: &str,
    user_template: &str,
    input: &str,
) -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            role: "system".to_string(),
            content: system_template.replace("{{input}}", input),
        },
        ChatMessage {
            role: "user".to_string(),
            content: user_template.replace("{{input}}", input),
        },
    ]
}

fn truncate(text: &str, max: usize) -> String {
    let mut end = max.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_input() {
        let messages = render_messages("Summarize: {{input}}", "{{input}}", "the text");
        assert_eq!(messages[0].content, "Summarize: the text");
        assert_eq!(messages[1].content, "the text");
        assert_eq!(messages[0].role, "system");
    }

    #[test]
    fn response_shape_parses() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "short summary"}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("short summary")
        );
        assert_eq!(parsed.usage.unwrap().prompt_tokens, Some(100));
    }
}
