//! 核心层：错误分类、恢复与重试、工具调用协议、组件工厂、状态管理与优雅关闭

pub mod error;
pub mod protocol;
pub mod provider;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use error::AgentError;
pub use protocol::ParsedResponse;
pub use provider::{ComponentProvider, ConfigComponentProvider};
pub use recovery::{
    CapabilityCategory, CapabilityHealth, HealthSnapshot, RecoveryConfig, RecoveryManager, Retryable,
    RetryPolicy,
};
pub use shutdown::{RequestGuard, RequestTracker};
pub use state::{HealthReport, RetrievalStage, StateManager, DEFAULT_SYSTEM_PROMPT};
