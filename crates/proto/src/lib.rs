//! ModelServe gateway types
//!
//! Request and response shapes exchanged with the HTTP/RPC gateway. The
//! gateway itself lives outside this workspace; engines and the dispatcher
//! speak these types at their inbound boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One prompt or an ordered list of prompts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Single(String),
    Many(Vec<String>),
}

impl PromptInput {
    /// Flatten into an ordered list of prompts
    pub fn into_vec(self) -> Vec<String> {
        match self {
            PromptInput::Single(prompt) => vec![prompt],
            PromptInput::Many(prompts) => prompts,
        }
    }
}

impl From<&str> for PromptInput {
    fn from(prompt: &str) -> Self {
        PromptInput::Single(prompt.to_string())
    }
}

impl From<Vec<String>> for PromptInput {
    fn from(prompts: Vec<String>) -> Self {
        PromptInput::Many(prompts)
    }
}

// Generation service types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: PromptInput,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_max_length")]
    pub max_length: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_num_return_sequences")]
    pub num_return_sequences: u32,
}

impl GenerateRequest {
    /// Request with default sampling parameters
    pub fn new(prompt: impl Into<PromptInput>) -> Self {
        Self {
            prompt: prompt.into(),
            model_name: None,
            version: None,
            max_length: default_max_length(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            num_return_sequences: default_num_return_sequences(),
        }
    }

    /// Target a specific model
    pub fn with_model(mut self, name: impl Into<String>, version: Option<String>) -> Self {
        self.model_name = Some(name.into());
        self.version = version;
        self
    }

    /// Override the sampling temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

fn default_max_length() -> u32 {
    512
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_top_k() -> u32 {
    50
}

fn default_num_return_sequences() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub generated_text: Vec<String>,
    pub model_name: String,
    pub version: String,
    /// Seconds spent serving the request
    pub generation_time: f64,
    pub token_count: u64,
    #[serde(default)]
    pub cached: bool,
}

// Catalog listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub version: String,
    pub registered_at: String,
    pub status: String,
    pub content_hash: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListModelsResponse {
    pub models: Vec<ModelSummary>,
    pub default_model: Option<String>,
    pub default_version: Option<String>,
}

// Health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub device: String,
    pub loaded_models: Vec<String>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_input_accepts_string_or_list() {
        let single: GenerateRequest = serde_json::from_str(r#"{"prompt": "hello"}"#).unwrap();
        assert_eq!(single.prompt.into_vec(), vec!["hello".to_string()]);

        let many: GenerateRequest =
            serde_json::from_str(r#"{"prompt": ["a", "b"], "temperature": 0.2}"#).unwrap();
        assert_eq!(many.prompt.into_vec().len(), 2);
        assert_eq!(many.temperature, 0.2);
        assert_eq!(many.max_length, 512);
        assert_eq!(many.top_k, 50);
    }
}
