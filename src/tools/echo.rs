//! Echo 工具（连通性诊断用）

use crate::tools::{ToolCapability, ToolError};

/// Echo 工具：回显输入
pub struct EchoTool;

impl ToolCapability for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input back unchanged (diagnostics). Input: any text."
    }

    fn run(&self, input: &str) -> Result<String, ToolError> {
        if input.trim().is_empty() {
            return Ok("(empty)".to_string());
        }
        Ok(input.to_string())
    }
}
