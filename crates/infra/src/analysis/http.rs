//! OpenAI-compatible chat-completions analyzer (blocking).

use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, warn};

use super::{AnalysisError, AnalysisRequest, Analyzer};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const DEFAULT_SYSTEM_PROMPT: &str = "You review product documents. \
Report problems you find as a JSON object with an `issues` array; each issue has \
`location`, `problem` and `suggestion` fields. Reply with JSON only.";

/// Statuses worth retrying: rate limiting and gateway/server hiccups.
const TRANSIENT_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[derive(Debug, Clone, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: String,
}

pub struct HttpChatAnalyzer {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    system_prompt: String,
    client: Client,
}

impl HttpChatAnalyzer {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AnalysisError::Fatal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            system_prompt: system_prompt.into(),
            client,
        })
    }

    /// Read the system prompt from `path`, falling back to a built-in prompt.
    pub fn load_prompt(path: &Path) -> String {
        match std::fs::read_to_string(path) {
            Ok(prompt) if !prompt.trim().is_empty() => {
                info!(path = %path.display(), "Loaded analysis prompt");
                prompt
            }
            Ok(_) => {
                warn!(path = %path.display(), "Prompt file is empty, using built-in prompt");
                DEFAULT_SYSTEM_PROMPT.to_string()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Prompt file unreadable, using built-in prompt");
                DEFAULT_SYSTEM_PROMPT.to_string()
            }
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }
}

impl Analyzer for HttpChatAnalyzer {
    fn analyze(&self, request: &AnalysisRequest) -> Result<JsonValue, AnalysisError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AnalysisError::Fatal("no LLM API key configured".to_string()))?;

        let user_message = user_message(request);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &user_message,
                },
            ],
        };

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .map_err(|e| AnalysisError::Transient(format!("LLM request failed: {e}")))?;

        let status = response.status();
        debug!(status = %status, model = %self.model, "LLM responded");

        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(classify_status(status, &detail));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| AnalysisError::Fatal(format!("malformed LLM response: {e}")))?;
        let answer = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AnalysisError::Fatal("LLM response has no choices".to_string()))?;

        Ok(parse_answer(&answer))
    }
}

fn user_message(request: &AnalysisRequest) -> String {
    let mut message = String::new();
    if let Some(product) = &request.product {
        message.push_str(&format!("Product: {product}\n"));
    }
    if let Some(feature) = &request.feature {
        message.push_str(&format!("Feature: {feature}\n"));
    }
    if !message.is_empty() {
        message.push('\n');
    }
    message.push_str("Document:\n");
    message.push_str(&request.text);
    message
}

fn classify_status(status: StatusCode, detail: &str) -> AnalysisError {
    let detail: String = detail.chars().take(512).collect();
    let message = format!("LLM call failed, status={}, body={detail}", status.as_u16());
    if TRANSIENT_STATUSES.contains(&status) {
        AnalysisError::Transient(message)
    } else {
        AnalysisError::Fatal(message)
    }
}

/// Interpret the model's answer as a JSON object when possible.
fn parse_answer(answer: &str) -> JsonValue {
    let trimmed = strip_code_fence(answer.trim());
    match serde_json::from_str::<JsonValue>(trimmed) {
        Ok(value @ JsonValue::Object(_)) => value,
        _ => json!({ "answer": answer }),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (```json) up to the first newline.
    let body = rest.split_once('\n').map_or(rest, |(_, body)| body);
    body.strip_suffix("```").unwrap_or(body).trim()
}
