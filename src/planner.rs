//! Text planner: turns a prompt into an action plan.
//!
//! Only the trait and an HTTP client for an Anthropic-compatible messages
//! endpoint live here. Failures are mapped into [`OpError`] so planning
//! calls can be wrapped by the self-healer like any other external call.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{FailureKind, OpError};

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub system: Option<String>,
    pub max_tokens: u32,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            system: None,
            max_tokens: 1024,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, prompt: &str, options: &PlanOptions) -> Result<String, OpError>;
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

pub struct LlmPlanner {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmPlanner {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self, OpError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    /// `PLANNER_BASE_URL` and `PLANNER_API_KEY` are required,
    /// `PLANNER_MODEL` is optional.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("PLANNER_BASE_URL").ok()?;
        let api_key = std::env::var("PLANNER_API_KEY").ok()?;
        let model = std::env::var("PLANNER_MODEL").unwrap_or_else(|_| "claude-3-5-haiku-latest".to_string());
        Self::new(&base_url, &api_key, &model).ok()
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, prompt: &str, options: &PlanOptions) -> Result<String, OpError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: options.max_tokens,
            system: options.system.as_deref(),
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };
        info!(model = %self.model, prompt_length = prompt.len(), "planner request");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        parse_response(status, &body)
    }
}

/// Map a raw HTTP response to plan text or a classified error.
fn parse_response(status: u16, body: &str) -> Result<String, OpError> {
    if !(200..300).contains(&status) {
        let detail = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|e| e.msg.or_else(|| e.error.and_then(|d| d.message)))
            .unwrap_or_else(|| body.chars().take(200).collect());
        return Err(OpError::http(status, format!("planner error: {}", detail)));
    }

    let parsed: MessagesResponse = serde_json::from_str(body)?;
    if let Some(usage) = &parsed.usage {
        info!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "planner response"
        );
    }
    let text: String = parsed
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect();
    if text.is_empty() {
        return Err(OpError::new(FailureKind::MalformedData, "planner returned no text"));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_blocks_joined() {
        let body = r#"{
            "content": [
                {"type": "text", "text": "raise "},
                {"type": "tool_use"},
                {"type": "text", "text": "prices"}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 2}
        }"#;
        assert_eq!(parse_response(200, body).unwrap(), "raise prices");
    }

    #[test]
    fn test_error_status_classified() {
        let err = parse_response(429, r#"{"error": {"message": "rate limited"}}"#).unwrap_err();
        assert_eq!(err.kind, FailureKind::RateLimited);
        assert!(err.message.contains("rate limited"));

        let err = parse_response(503, "upstream down").unwrap_err();
        assert_eq!(err.kind, FailureKind::ServerError);
    }

    #[test]
    fn test_garbage_body_is_malformed() {
        let err = parse_response(200, "<html>").unwrap_err();
        assert_eq!(err.kind, FailureKind::MalformedData);
        let err = parse_response(200, r#"{"content": []}"#).unwrap_err();
        assert_eq!(err.kind, FailureKind::MalformedData);
    }

    #[test]
    fn test_request_omits_empty_system() {
        let req = MessagesRequest {
            model: "m",
            max_tokens: 5,
            system: None,
            messages: vec![Message { role: "user", content: "hi" }],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("system").is_none());
        assert_eq!(json["messages"][0]["content"], "hi");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_failure() {
        let planner = LlmPlanner::new("http://127.0.0.1:1", "key", "m").unwrap();
        let err = planner.plan("hi", &PlanOptions::default()).await.unwrap_err();
        assert!(matches!(
            err.kind,
            FailureKind::ConnectionRefused | FailureKind::Timeout
        ));
    }
}
