//! Agent 错误类型
//!
//! 覆盖查询路径上的失败：未初始化、初始化失败、LLM 失败、工具调用失败。
//! 持久化失败保持为 SessionError，由 Dispatcher 记录后继续。解析失败不是错误：
//! 不符合 `Action:` / `Action Input:` 语法的输出按直接回答处理。

use thiserror::Error;

use crate::llm::LlmError;
use crate::tools::ToolError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 必需阶段未完成（或已被 reset），请求在任何恢复尝试之前短路
    #[error("Components are not initialized")]
    NotInitialized,

    #[error("Initialization failed at stage '{stage}': {message}")]
    InitializationFailed { stage: &'static str, message: String },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool '{tool}' failed: {source}")]
    ToolInvocation {
        tool: String,
        #[source]
        source: ToolError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_prefixed_and_short() {
        let err = AgentError::ToolInvocation {
            tool: "edr_lookup".into(),
            source: ToolError::Failed("401 Unauthorized".into()),
        };
        assert_eq!(err.to_string(), "Tool 'edr_lookup' failed: 401 Unauthorized");
    }

    #[test]
    fn test_llm_error_converts() {
        let err: AgentError = LlmError::Timeout.into();
        assert!(matches!(err, AgentError::Llm(LlmError::Timeout)));
        assert_eq!(err.to_string(), "LLM error: Request timed out");
    }
}
