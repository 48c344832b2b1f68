//! socbot - 安全运营对话式 Agent 运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复与重试、`Action:` 协议解析、组件工厂与 StateManager
//! - **dispatcher**: 单请求状态机 `ask()`、快速通道命令、健康自检
//! - **llm**: LLM / 嵌入客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话消息模型、SQLite 会话存储、Runbook 检索
//! - **observability**: 日志订阅器
//! - **tools**: ToolCapability 契约、注册表与执行器

pub mod config;
pub mod core;
pub mod dispatcher;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;

pub use crate::core::{StateManager, RecoveryManager};
pub use crate::dispatcher::Dispatcher;
