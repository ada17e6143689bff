use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use cinestream_common::STEP_TIMEOUT_SECS;

use super::prompts;
use super::schema::{tool_input_schema, MovieList, ShowtimeList, TheaterList};
use super::{ExtractionClient, ExtractionError, StepPayload};
use crate::clock::{Clock, SystemClock};
use crate::decomposer::{ExtractionStep, StepKind};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const TOOL_NAME: &str = "record_results";
const MAX_TOKENS: u32 = 8192;
const MAX_WEB_SEARCHES: u32 = 5;

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<WireMessage>,
    tools: Vec<Value>,
    tool_choice: Value,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },
    /// Server tool traffic (web search calls and results).
    #[serde(other)]
    Other,
}

// =============================================================================
// ClaudeExtractor
// =============================================================================

/// Extraction client backed by the Anthropic Messages API.
///
/// Each step is a single request: web search as a server tool, plus one
/// client tool whose input schema is the step's result shape. The tool's
/// input is the extraction result.
#[derive(Clone)]
pub struct ClaudeExtractor {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
    web_search: bool,
    clock: Arc<dyn Clock>,
}

impl ClaudeExtractor {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
            timeout: Duration::from_secs(STEP_TIMEOUT_SECS),
            web_search: true,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_web_search(mut self, enabled: bool) -> Self {
        self.web_search = enabled;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn headers(&self) -> Result<HeaderMap, ExtractionError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| ExtractionError::Upstream(format!("invalid api key header: {e}")))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn request<T: JsonSchema>(&self, system: String, user: String) -> MessagesRequest {
        let mut tools = Vec::new();
        if self.web_search {
            tools.push(json!({
                "type": "web_search_20250305",
                "name": "web_search",
                "max_uses": MAX_WEB_SEARCHES,
            }));
        }
        tools.push(json!({
            "name": TOOL_NAME,
            "description": "Record the extracted results. Call exactly once when done researching.",
            "input_schema": tool_input_schema::<T>(),
        }));

        // Forcing the record tool would rule out searching first.
        let tool_choice = if self.web_search {
            json!({ "type": "auto" })
        } else {
            json!({ "type": "tool", "name": TOOL_NAME })
        };

        MessagesRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            system,
            messages: vec![WireMessage {
                role: "user",
                content: user,
            }],
            tools,
            tool_choice,
            temperature: 0.0,
        }
    }

    async fn call<T: JsonSchema + DeserializeOwned>(
        &self,
        system: String,
        user: String,
    ) -> Result<T, ExtractionError> {
        let request = self.request::<T>(system, user);
        let url = format!("{}/messages", self.base_url);
        debug!(model = %self.model, "Claude extraction request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| upstream(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Upstream(format!(
                "Claude API error ({status}): {body}"
            )));
        }

        let response: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ExtractionError::Malformed(format!("undecodable response: {e}")))?;
        tool_output(response)
    }

    async fn run_step(&self, step: &ExtractionStep) -> Result<StepPayload, ExtractionError> {
        let now = self.clock.now();
        let system = prompts::system_prompt(now.date_naive());
        let user = prompts::step_prompt(step);

        match step.kind() {
            StepKind::TheaterDiscovery => {
                Ok(self.call::<TheaterList>(system, user).await?.into_payload())
            }
            StepKind::MovieDiscovery => Ok(self.call::<MovieList>(system, user).await?.into_payload()),
            StepKind::MovieDayExtraction => Ok(self
                .call::<ShowtimeList>(system, user)
                .await?
                .into_payload(now)),
        }
    }
}

#[async_trait]
impl ExtractionClient for ClaudeExtractor {
    async fn execute(&self, step: &ExtractionStep) -> Result<StepPayload, ExtractionError> {
        let payload = tokio::time::timeout(self.timeout, self.run_step(step))
            .await
            .map_err(|_| ExtractionError::Timeout(self.timeout))??;
        info!(
            city = %step.city,
            step = step.index,
            kind = %step.kind(),
            results = payload.len(),
            "Extraction step complete"
        );
        Ok(payload)
    }
}

/// Pull the record tool's input out of the response.
fn tool_output<T: DeserializeOwned>(response: MessagesResponse) -> Result<T, ExtractionError> {
    let mut text = String::new();
    for block in response.content {
        match block {
            ContentBlock::ToolUse { name, input } if name == TOOL_NAME => {
                return serde_json::from_value(input)
                    .map_err(|e| ExtractionError::Malformed(format!("tool input: {e}")));
            }
            ContentBlock::Text { text: t } => text.push_str(&t),
            _ => {}
        }
    }

    // Fall back to a JSON object in the text, possibly fenced.
    let stripped = strip_code_blocks(&text);
    if stripped.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str(stripped) {
            return Ok(parsed);
        }
    }

    Err(ExtractionError::Malformed(format!(
        "no structured output (stop_reason: {})",
        response.stop_reason.as_deref().unwrap_or("unknown")
    )))
}

fn strip_code_blocks(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn upstream(err: reqwest::Error, timeout: Duration) -> ExtractionError {
    if err.is_timeout() {
        ExtractionError::Timeout(timeout)
    } else {
        ExtractionError::Upstream(err.to_string())
    }
}
