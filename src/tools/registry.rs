//! 工具注册表
//!
//! 所有工具实现 ToolCapability（name / description / run），由 ToolRegistry 按名注册与查找。
//! description 会原样注入到 LLM 提示词的可用工具列表中。

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::core::{CapabilityCategory, Retryable};

/// 工具执行错误；「查无结果」等正常结果应以文本返回，而不是 Err
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// 可重试（网络抖动、限流、上游 5xx）
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Failed(String),
}

impl Retryable for ToolError {
    fn is_transient(&self) -> bool {
        matches!(self, ToolError::Transient(_))
    }
}

/// 工具能力：名称、描述（供 LLM 理解）、同步执行（输入为 Action Input 原文）
pub trait ToolCapability: Send + Sync {
    /// 工具名称（对应 `Action:` 行）
    fn name(&self) -> &str;

    /// 工具描述（原样注入提示词）
    fn description(&self) -> &str;

    /// 所属集成类别，决定重试策略与兜底文案
    fn category(&self) -> CapabilityCategory {
        CapabilityCategory::General
    }

    fn run(&self, input: &str) -> Result<String, ToolError>;
}

/// 工具注册表：按名称存储 Arc<dyn ToolCapability>；BTreeMap 保证提示词中的工具顺序稳定
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolCapability>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl ToolCapability + 'static) {
        self.register_arc(Arc::new(tool));
    }

    /// 注册外部持有的工具（核心只保存引用）
    pub fn register_arc(&mut self, tool: Arc<dyn ToolCapability>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolCapability>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 返回 (name, category) 列表，供恢复管理器登记健康状态
    pub fn categories(&self) -> Vec<(String, CapabilityCategory)> {
        self.tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.category()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 生成 prompt 中的 Available tools 段落：每行 `- name: description`
    pub fn describe(&self) -> String {
        self.tools
            .iter()
            .map(|(name, tool)| format!("- {}: {}", name, tool.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
