use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Core trait for completion providers
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a completion for the given prompt
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse>;

    /// Model identifier, for logging and status reporting
    fn model(&self) -> &str;
}

/// Request structure for LLM generation
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// Optional system instruction sent ahead of the prompt
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

pub mod remote;

/// Helper to extract JSON from text that might contain markdown backticks or preamble
pub fn extract_json_from_text(text: &str) -> Option<String> {
    // 1. Try to find content between ```json and ```
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 2. Try to find content between ``` and ```
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            let inner = rest[..end].trim();
            // Language tag on the fence line, e.g. ```JSON
            let inner = inner
                .strip_prefix("json")
                .or_else(|| inner.strip_prefix("JSON"))
                .unwrap_or(inner)
                .trim();
            if inner.starts_with('{') {
                return Some(inner.to_string());
            }
        }
    }

    // 3. Try to find the first '{' and last '}'
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return Some(text[start..=end].to_string());
        }
    }

    None
}
