//! Client for the OpenAI Responses API.

use crate::config::LlmConfig;
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to build http client: {0}")]
    Client(reqwest::Error),
    #[error("Model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Model service returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelRequest {
    pub instructions: String,
    pub input: Vec<InputItem>,
    pub tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Message { role: String, content: String },
    FunctionCallOutput { call_id: String, output: ToolOutput },
}

impl InputItem {
    pub fn user(content: impl Into<String>) -> Self {
        InputItem::Message {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// What a tool hands back to the model: plain text, or content parts when
/// the model should look at an image.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Text(String),
    Content(Vec<ContentPart>),
}

impl ToolOutput {
    pub fn error(message: impl std::fmt::Display) -> Self {
        ToolOutput::Text(serde_json::json!({ "error": message.to_string() }).to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
    InputImage { image_url: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolDefinition {
    Function {
        name: String,
        description: String,
        parameters: Value,
        strict: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelResponse {
    pub id: String,
    #[serde(default)]
    pub output: Vec<OutputItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<MessageContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    OutputText {
        text: String,
    },
    Refusal {
        refusal: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

impl ModelResponse {
    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => Some(FunctionCall {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn output_text(&self) -> String {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputItem::Message { content } => Some(content),
                _ => None,
            })
            .flatten()
            .filter_map(|part| match part {
                MessageContent::OutputText { text } => Some(text.trim()),
                MessageContent::Refusal { refusal } => Some(refusal.trim()),
                MessageContent::Other => None,
            })
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync + 'static {
    async fn respond(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    #[serde(flatten)]
    request: &'a ModelRequest,
}

pub struct OpenAiClient {
    http: Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self, ModelError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(ModelError::Client)?;

        Ok(Self {
            http,
            url: config.get_responses_url(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn respond(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let body = WireRequest {
            model: &self.model,
            request,
        };

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ModelResponse = response.json().await?;
        tracing::debug!(
            "Model response {} with {} output items",
            parsed.id,
            parsed.output.len()
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_response_with_text_and_calls() {
        let raw = json!({
            "id": "resp_123",
            "object": "response",
            "output": [
                { "type": "reasoning", "id": "rs_1", "summary": [] },
                {
                    "type": "function_call",
                    "id": "fc_1",
                    "call_id": "call_a",
                    "name": "capture_encode_frame",
                    "arguments": "{\"stream_url\":\"rtsp://cam\"}"
                },
                {
                    "type": "message",
                    "role": "assistant",
                    "content": [
                        { "type": "output_text", "text": " Alarm Triggered: no ", "annotations": [] },
                        { "type": "output_text", "text": "" }
                    ]
                }
            ]
        });

        let response: ModelResponse = serde_json::from_value(raw).unwrap();

        assert_eq!(response.id, "resp_123");
        assert_eq!(
            response.function_calls(),
            vec![FunctionCall {
                call_id: "call_a".into(),
                name: "capture_encode_frame".into(),
                arguments: "{\"stream_url\":\"rtsp://cam\"}".into(),
            }]
        );
        assert_eq!(response.output_text(), "Alarm Triggered: no");
    }

    #[test]
    fn test_serialize_request_with_image_output() {
        let request = ModelRequest {
            instructions: "watch".into(),
            input: vec![InputItem::FunctionCallOutput {
                call_id: "call_a".into(),
                output: ToolOutput::Content(vec![ContentPart::InputImage {
                    image_url: "data:image/jpeg;base64,AAAA".into(),
                    detail: "low".into(),
                }]),
            }],
            tools: vec![ToolDefinition::Function {
                name: "capture_encode_frame".into(),
                description: "Capture".into(),
                parameters: json!({ "type": "object" }),
                strict: false,
            }],
            previous_response_id: Some("resp_123".into()),
        };

        let wire = serde_json::to_value(WireRequest {
            model: "gpt-4.1",
            request: &request,
        })
        .unwrap();

        assert_eq!(wire["model"], "gpt-4.1");
        assert_eq!(wire["previous_response_id"], "resp_123");
        assert_eq!(wire["tools"][0]["type"], "function");
        assert_eq!(wire["tools"][0]["strict"], false);
        assert_eq!(wire["input"][0]["type"], "function_call_output");
        assert_eq!(wire["input"][0]["output"][0]["type"], "input_image");
        assert_eq!(
            wire["input"][0]["output"][0]["image_url"],
            "data:image/jpeg;base64,AAAA"
        );
    }

    #[test]
    fn test_first_request_omits_previous_response_id() {
        let request = ModelRequest {
            instructions: "watch".into(),
            input: vec![InputItem::user("go")],
            ..Default::default()
        };

        let wire = serde_json::to_value(&request).unwrap();

        assert!(wire.get("previous_response_id").is_none());
        assert_eq!(wire["input"][0]["type"], "message");
        assert_eq!(wire["input"][0]["role"], "user");
    }

    #[test]
    fn test_error_output_is_json() {
        let ToolOutput::Text(text) = ToolOutput::error("Could not open video stream: rtsp://x")
        else {
            panic!("expected text output");
        };
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["error"], "Could not open video stream: rtsp://x");
    }
}
