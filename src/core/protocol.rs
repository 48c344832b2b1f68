//! 单次工具调用协议
//!
//! LLM 的回复要么是直接回答，要么同时包含 `Action:` 与 `Action Input:` 两个标记：
//!
//! ```text
//! Action: ioc_lookup
//! Action Input: 203.0.113.7
//! ```
//!
//! 不符合该语法的输出一律按直接回答处理，不算错误。

use std::sync::OnceLock;

use regex::Regex;

/// 解析后的 LLM 回复
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedResponse {
    Direct(String),
    ToolCall { name: String, argument: String },
}

const ACTION_MARKER: &str = "Action:";
const INPUT_MARKER: &str = "Action Input:";

fn action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Action:[ \t]*([^\r\n]*)").expect("valid regex"))
}

fn input_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)Action Input:[ \t]*(.*?)(?:\r?\nObservation:|\z)").expect("valid regex")
    })
}

fn strip_quotes(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`').trim()
}

impl ParsedResponse {
    /// 解析 LLM 输出；工具名为空时视为直接回答
    pub fn parse(output: &str) -> Self {
        if !output.contains(ACTION_MARKER) || !output.contains(INPUT_MARKER) {
            return ParsedResponse::Direct(output.to_string());
        }

        let name = action_re()
            .captures(output)
            .and_then(|c| c.get(1))
            .map(|m| strip_quotes(m.as_str()).to_string())
            .unwrap_or_default();
        if name.is_empty() {
            return ParsedResponse::Direct(output.to_string());
        }

        let argument = input_re()
            .captures(output)
            .and_then(|c| c.get(1))
            .map(|m| strip_quotes(m.as_str()).to_string())
            .unwrap_or_default();

        ParsedResponse::ToolCall { name, argument }
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self, ParsedResponse::ToolCall { .. })
    }
}
