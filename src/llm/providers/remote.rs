use crate::config::LlmConfig;
use crate::llm::models::{ChatMessage, MessageRole, ModelTurn, ToolDefinition, ToolUse};
use crate::llm::{ChatModel, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// OpenAI-compatible chat-completions provider with native function calling.
pub struct RemoteLlmProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    // The chat-completions API carries arguments as a JSON-encoded string
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionDef,
}

#[derive(Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

impl RemoteLlmProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config.api_url.clone().ok_or_else(|| {
            LlmError::ConfigError("API URL is required for remote LLM provider".to_string())
        })?;

        let api_key = config.api_key.clone().ok_or_else(|| {
            LlmError::ConfigError("API key is required for remote LLM provider".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key,
            model: config.model.clone(),
        })
    }

    fn to_wire(system: &str, messages: &[ChatMessage]) -> Vec<WireMessage> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(WireMessage {
            role: "system".to_string(),
            content: system.to_string(),
            tool_calls: None,
            tool_call_id: None,
        });

        for msg in messages {
            let role = match msg.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::Tool => "tool",
            };
            let tool_calls = if msg.tool_calls.is_empty() {
                None
            } else {
                Some(
                    msg.tool_calls
                        .iter()
                        .map(|tc| WireToolCall {
                            id: tc.id.clone(),
                            kind: "function".to_string(),
                            function: WireFunctionCall {
                                name: tc.name.clone(),
                                arguments: tc.arguments.to_string(),
                            },
                        })
                        .collect(),
                )
            };
            wire.push(WireMessage {
                role: role.to_string(),
                content: msg.content.clone(),
                tool_calls,
                tool_call_id: msg.tool_call_id.clone(),
            });
        }

        wire
    }
}

#[async_trait]
impl ChatModel for RemoteLlmProvider {
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, LlmError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: Self::to_wire(system, messages),
            temperature: 0.1,
            max_tokens: 4000,
            tools: tools
                .iter()
                .map(|t| WireTool {
                    kind: "function".to_string(),
                    function: WireFunctionDef {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        };

        debug!("Sending chat request to {} with model {}", self.api_url, self.model);

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::ResponseError(format!(
                "API responded with status code: {}",
                response.status()
            )));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseError(e.to_string()))?;

        if chat_response.choices.is_empty() {
            return Err(LlmError::ResponseError("No choices in response".to_string()));
        }

        let message = &chat_response.choices[0].message;

        // Tool-call arguments arrive as JSON strings; decode them up front so the
        // caller only ever sees structured values.
        let mut tool_calls = Vec::new();
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .map_err(|e| {
                        LlmError::ResponseError(format!(
                            "Malformed tool-call arguments for {}: {}",
                            call.function.name, e
                        ))
                    })?;
                tool_calls.push(ToolUse {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    arguments,
                });
            }
        }

        Ok(ModelTurn {
            text: message.content.clone().unwrap_or_default(),
            tool_calls,
        })
    }
}
