pub mod models;
pub mod providers;

use crate::config::LlmConfig;
use async_trait::async_trait;
use models::{ChatMessage, ModelTurn, ToolDefinition};
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum LlmError {
    ConnectionError(String),
    ResponseError(String),
    ConfigError(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::ConnectionError(msg) => write!(f, "LLM connection error: {}", msg),
            LlmError::ResponseError(msg) => write!(f, "LLM response error: {}", msg),
            LlmError::ConfigError(msg) => write!(f, "LLM configuration error: {}", msg),
        }
    }
}

impl Error for LlmError {}

/// A chat model that can answer with text, request function invocations, or both.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, LlmError>;
}

pub struct LlmManager {
    model: Box<dyn ChatModel + Send + Sync>,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let model: Box<dyn ChatModel + Send + Sync> = match config.backend.as_str() {
            "remote" => Box::new(providers::remote::RemoteLlmProvider::new(config)?),
            "ollama" => Box::new(providers::ollama::OllamaProvider::new(config)?),
            _ => {
                return Err(LlmError::ConfigError(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )))
            }
        };

        Ok(Self { model })
    }

    /// Wraps an already-constructed model. Used to inject test doubles and
    /// per-request clients.
    pub fn from_model(model: Box<dyn ChatModel + Send + Sync>) -> Self {
        Self { model }
    }

    pub async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, LlmError> {
        self.model.chat(system, messages, tools).await
    }
}

#[async_trait]
impl ChatModel for LlmManager {
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, LlmError> {
        self.model.chat(system, messages, tools).await
    }
}
