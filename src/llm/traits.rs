//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::complete。调用是同步阻塞的：
//! 每个请求独占一个工作线程，慢调用只能被观测（超时告警），不能被取消。

use std::time::Duration;

use thiserror::Error;

use crate::core::Retryable;
use crate::memory::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("LLM unavailable: {0}")]
    Unavailable(String),
}

impl Retryable for LlmError {
    fn is_transient(&self) -> bool {
        match self {
            LlmError::Network(_) | LlmError::Timeout | LlmError::RateLimited { .. } => true,
            LlmError::Http { status, .. } => *status >= 500,
            LlmError::InvalidResponse(_) | LlmError::Unavailable(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }
}

/// LLM 客户端 trait：非流式完成
pub trait LlmClient: Send + Sync {
    /// 发送完整消息列表，返回首条 completion 文本
    fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 模型名（健康检查与日志用）
    fn model_name(&self) -> &str {
        "unknown"
    }

    /// 累计 token 使用：(prompt_tokens, completion_tokens, total_tokens)；不统计的后端返回 (0, 0, 0)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
