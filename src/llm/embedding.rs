//! 嵌入 API：供 Runbook 检索使用，调用 OpenAI 兼容的 /embeddings 端点

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::openai::{check_status, map_transport_error, resolve_api_key, DEFAULT_BASE_URL};
use crate::llm::LlmError;

/// 嵌入提供方（同步调用）
pub trait EmbeddingProvider: Send + Sync {
    /// 将文本编码为向量
    fn embed_sync(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// 调用 OpenAI 兼容的 embeddings API
pub struct OpenAiEmbedder {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbedder {
    /// 与 LLM 共用 OPENAI_API_KEY / base_url
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        timeout_secs: u64,
    ) -> Result<Self, LlmError> {
        let api_key = resolve_api_key(api_key)
            .ok_or_else(|| LlmError::Unavailable("no API key configured for embeddings".to_string()))?;
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        })
    }
}

impl EmbeddingProvider for OpenAiEmbedder {
    fn embed_sync(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![]);
        }
        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .map_err(map_transport_error)?;
        let body: EmbeddingResponse = check_status(response)?
            .json()
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .unwrap_or_default())
    }
}
