//! 工具层：ToolCapability 契约、注册表、带重试与审计的执行器，以及内置的诊断 / 检索工具

pub mod echo;
pub mod executor;
pub mod registry;
pub mod runbook_search;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{ToolCapability, ToolError, ToolRegistry};
pub use runbook_search::RunbookSearchTool;
