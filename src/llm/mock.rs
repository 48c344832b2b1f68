//! Mock LLM / 嵌入客户端（用于测试与离线运行，无需 API）
//!
//! MockLlmClient 按脚本依次返回预设结果，脚本耗尽后回显最后一条 User 消息；
//! 所有调用收到的消息列表都会被记录，便于断言提示词内容。

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::llm::{EmbeddingProvider, LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Mock 客户端：脚本化回复 + 调用记录
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序返回给定结果
    pub fn scripted(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 第 n 次调用收到的消息
    pub fn call(&self, n: usize) -> Option<Vec<Message>> {
        self.calls.lock().ok().and_then(|c| c.get(n).cloned())
    }
}

impl LlmClient for MockLlmClient {
    fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        if let Some(response) = scripted {
            return response;
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {}", last_user))
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// 确定性嵌入：按小写词哈希到固定维度的词袋向量，词重叠越多余弦越高
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimensions: usize,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EmbeddingProvider for MockEmbedder {
    fn embed_sync(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut vector = vec![0.0f32; self.dimensions];
        let mut any = false;
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            let idx = (hasher.finish() % self.dimensions as u64) as usize;
            vector[idx] += 1.0;
            any = true;
        }
        if any {
            Ok(vector)
        } else {
            Ok(vec![])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_then_echo() {
        let llm = MockLlmClient::scripted(vec![Ok("first".into()), Err(LlmError::Timeout)]);
        let msgs = vec![Message::user("ping")];
        assert_eq!(llm.complete(&msgs).unwrap(), "first");
        assert_eq!(llm.complete(&msgs), Err(LlmError::Timeout));
        assert_eq!(llm.complete(&msgs).unwrap(), "Echo from Mock: ping");
        assert_eq!(llm.call_count(), 3);
    }

    #[test]
    fn test_embedder_is_deterministic() {
        let e = MockEmbedder::default();
        let a = e.embed_sync("Isolate host via EDR").unwrap();
        let b = e.embed_sync("isolate HOST via edr").unwrap();
        assert_eq!(a, b);
        assert!(e.embed_sync("   ").unwrap().is_empty());
    }
}
