use crate::config::LlmConfig;
use crate::llm::models::{ChatMessage, MessageRole, ModelTurn, ToolDefinition, ToolUse};
use crate::llm::{ChatModel, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Ollama /api/chat provider. Tool calling is supported by recent Ollama
/// releases; models without tool support simply answer with text.
pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
}

#[derive(Serialize, Debug)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Serialize, Debug)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    message: OllamaResponseMessage,
    // Use serde to ignore unknown fields
    #[serde(flatten)]
    extra: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

#[derive(Deserialize, Debug)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Deserialize, Debug)]
struct OllamaFunctionCall {
    name: String,
    arguments: serde_json::Value,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434/api/chat".to_string());

        let client = reqwest::Client::new();

        Ok(Self {
            client,
            api_url,
            model: config.model.clone(),
        })
    }

    fn to_wire(system: &str, messages: &[ChatMessage]) -> Vec<OllamaMessage> {
        let mut wire = vec![OllamaMessage {
            role: "system".to_string(),
            content: system.to_string(),
        }];

        for msg in messages {
            let role = match msg.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::Tool => "tool",
            };
            wire.push(OllamaMessage {
                role: role.to_string(),
                content: msg.content.clone(),
            });
        }

        wire
    }
}

#[async_trait]
impl ChatModel for OllamaProvider {
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, LlmError> {
        info!("Sending request to Ollama with model: {}", self.model);
        debug!("API URL: {}", self.api_url);

        let request = OllamaRequest {
            model: self.model.clone(),
            messages: Self::to_wire(system, messages),
            stream: false, // Explicitly disable streaming
            options: OllamaOptions { temperature: 0.1 },
            tools: tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect(),
        };

        let response = self
            .client
            .post(&self.api_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            // Try to get the error message from the response body
            let error_body = match response.text().await {
                Ok(body) => format!(" - Response body: {}", body),
                Err(_) => String::new(),
            };

            error!("Ollama API responded with status code: {}{}", status, error_body);
            return Err(LlmError::ResponseError(format!(
                "Ollama API responded with status code: {}{}",
                status, error_body
            )));
        }

        // Get the raw text response first for diagnostics
        let response_text = response.text().await
            .map_err(|e| LlmError::ResponseError(format!("Failed to read response body: {}", e)))?;

        debug!("Raw response from Ollama: {}", response_text);

        let ollama_response = match serde_json::from_str::<OllamaResponse>(&response_text) {
            Ok(resp) => resp,
            Err(e) => {
                error!("Failed to parse Ollama response: {} - Response was: {}", e, response_text);
                return Err(LlmError::ResponseError(format!(
                    "Failed to parse Ollama response: {} - Response was: {}",
                    e, response_text
                )));
            }
        };

        // Ollama tool calls carry no id; synthesize sequential ones so the
        // conversation bookkeeping stays uniform across providers.
        let mut tool_calls = Vec::new();
        if let Some(calls) = ollama_response.message.tool_calls {
            for (i, call) in calls.into_iter().enumerate() {
                tool_calls.push(ToolUse {
                    id: format!("ollama_call_{}", i),
                    name: call.function.name,
                    arguments: call.function.arguments,
                });
            }
        }

        Ok(ModelTurn {
            text: ollama_response.message.content,
            tool_calls,
        })
    }
}
