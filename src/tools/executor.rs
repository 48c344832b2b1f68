//! 工具执行器
//!
//! invoke(tool, input) 经 RecoveryManager::with_retry 调用工具（瞬时失败按类别策略重试），
//! 工具 panic 视为永久失败；失败转为 AgentError::ToolInvocation。每次调用输出一条结构化审计日志（JSON）。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::core::{AgentError, RecoveryManager};
use crate::observability::preview;
use crate::tools::{ToolCapability, ToolError};

/// 工具执行器：重试 + 审计
pub struct ToolExecutor {
    recovery: Arc<RecoveryManager>,
}

impl ToolExecutor {
    pub fn new(recovery: Arc<RecoveryManager>) -> Self {
        Self { recovery }
    }

    /// 执行一次工具调用（含重试）；输出 JSON 审计日志
    pub fn invoke(&self, tool: &dyn ToolCapability, input: &str) -> Result<String, AgentError> {
        let start = Instant::now();
        let name = tool.name().to_string();
        let mut attempts = 0u32;

        let result = self.recovery.with_retry(&name, || {
            attempts += 1;
            run_caught(tool, input)
        });

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "category": tool.category().as_str(),
            "ok": result.is_ok(),
            "attempts": attempts,
            "duration_ms": start.elapsed().as_millis() as u64,
            "input_preview": preview(input, 200),
        });
        tracing::info!(audit = %audit, "tool");

        result.map_err(|source| AgentError::ToolInvocation { tool: name, source })
    }
}

fn run_caught(tool: &dyn ToolCapability, input: &str) -> Result<String, ToolError> {
    match catch_unwind(AssertUnwindSafe(|| tool.run(input))) {
        Ok(result) => result,
        Err(_) => Err(ToolError::Failed(format!("tool '{}' panicked", tool.name()))),
    }
}
