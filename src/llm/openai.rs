//! OpenAI 兼容 API 客户端
//!
//! 通过阻塞式 reqwest 调用任意 OpenAI 兼容端点（可配置 base_url）：POST {base_url}/chat/completions。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Token 使用统计（进程内累计值）
#[derive(Debug, Default)]
struct TokenUsage {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
}

impl TokenUsage {
    fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens
            .fetch_add(prompt.saturating_add(completion), Ordering::Relaxed);
    }

    fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// OpenAI 兼容客户端：持有 HTTP Client 与 model 名，complete 时转 Message 为 API 格式并取首条 content
pub struct OpenAiClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    usage: TokenUsage,
}

impl OpenAiClient {
    /// api_key 为空时读取 OPENAI_API_KEY；两者都没有则返回 Unavailable
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        timeout_secs: u64,
        temperature: f32,
    ) -> Result<Self, LlmError> {
        let api_key = resolve_api_key(api_key)
            .ok_or_else(|| LlmError::Unavailable("no API key configured".to_string()))?;
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            temperature,
            usage: TokenUsage::default(),
        })
    }
}

impl LlmClient for OpenAiClient {
    fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: role_str(&m.role),
                    content: &m.content,
                })
                .collect(),
            temperature: self.temperature,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(map_transport_error)?;
        let response = check_status(response)?;

        let body: ChatResponse = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        if let Some(usage) = &body.usage {
            self.usage.add(usage.prompt_tokens, usage.completion_tokens);
        }

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("response contained no content".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

fn role_str(role: &Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

pub(crate) fn resolve_api_key(api_key: Option<&str>) -> Option<String> {
    api_key
        .map(String::from)
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.trim().is_empty())
}

pub(crate) fn map_transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Network(e.to_string())
    }
}

/// 非 2xx 转为 LlmError；429 读取 retry-after（秒）
pub(crate) fn check_status(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 429 {
        let retry_after_ms = retry_after_ms(
            response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
        );
        return Err(LlmError::RateLimited { retry_after_ms });
    }
    let message = response.text().unwrap_or_default();
    Err(LlmError::Http {
        status: status.as_u16(),
        message: crate::observability::preview(&message, 200),
    })
}

/// Retry-After（整数秒）转毫秒；缺失或无法解析时为 1 秒
pub(crate) fn retry_after_ms(header: Option<&str>) -> u64 {
    header
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000))
        .unwrap_or(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_header() {
        assert_eq!(retry_after_ms(Some("7")), 7000);
        assert_eq!(retry_after_ms(Some(" 2 ")), 2000);
        assert_eq!(retry_after_ms(Some("Wed, 21 Oct 2015 07:28:00 GMT")), 1000);
        assert_eq!(retry_after_ms(None), 1000);
        assert_eq!(retry_after_ms(Some(&u64::MAX.to_string())), u64::MAX);
    }

    #[test]
    fn test_usage_accumulates() {
        let usage = TokenUsage::default();
        usage.add(120, 30);
        usage.add(80, 20);
        assert_eq!(usage.get(), (200, 50, 250));
    }
}
