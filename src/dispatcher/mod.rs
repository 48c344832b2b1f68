//! 请求分发：单个 `ask()` 请求的状态机
//!
//! 1. 空输入（含剥离机器人名后为空）直接返回固定提示，不触碰会话库
//! 2. 计算 session_key，惰性清理过期会话，读取上下文窗口（失败只记日志）
//! 3. 快速通道命令确定性应答，不调用 LLM
//! 4. 复杂路径：组件未就绪返回固定提示；否则经 RecoveryManager::guard 调用 StateManager::execute_query
//! 5. 无论走哪条路径、成功与否，恰好写入一条 user 与一条 assistant 消息
//! 6. 超过软阈值只记 warn，不取消
//!
//! `ask()` 总是返回文本，从不 panic 或返回错误。

pub mod fast_path;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::{RecoveryManager, StateManager};
use crate::memory::{session_key, Role, SessionStore};

pub use fast_path::{strip_bot_prefix, FastPathCommand};
pub use health_tests::{format_summary, HealthTestResult, HealthTestRunner, StateHealthTests};

pub const EMPTY_INPUT_RESPONSE: &str = "Please ask a question.";

pub const NOT_READY_RESPONSE: &str =
    "Sorry, I'm still starting up and can't answer questions yet. Please try again in a minute.";

pub const GREETING_RESPONSE: &str = "Hi! I'm socbot, the SOC assistant. Ask me about alerts, \
indicators (IPs, domains, hashes), hosts, tickets or runbook procedures. \
Type \"status\" to check my health or \"run health tests\" to run a self-test.";

/// 分发器设置
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub bot_names: Vec<String>,
    pub ttl_hours: u64,
    pub slow_request_warn: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl DispatcherSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            bot_names: config.app.bot_names.clone(),
            ttl_hours: config.session.ttl_hours,
            slow_request_warn: Duration::from_secs(config.dispatcher.slow_request_warn_secs),
        }
    }
}

pub struct Dispatcher {
    state: Arc<StateManager>,
    sessions: Arc<dyn SessionStore>,
    recovery: Arc<RecoveryManager>,
    health_tests: Option<Arc<dyn HealthTestRunner>>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        state: Arc<StateManager>,
        sessions: Arc<dyn SessionStore>,
        recovery: Arc<RecoveryManager>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            state,
            sessions,
            recovery,
            health_tests: None,
            settings,
        }
    }

    pub fn with_health_tests(mut self, runner: Arc<dyn HealthTestRunner>) -> Self {
        self.health_tests = Some(runner);
        self
    }

    /// 回答一条消息；message 为 None 等同于空输入
    pub fn ask(&self, message: Option<&str>, user_id: &str, room_id: &str) -> String {
        let raw = message.map(str::trim).unwrap_or_default();
        let query = strip_bot_prefix(raw, &self.settings.bot_names);
        if query.is_empty() {
            return EMPTY_INPUT_RESPONSE.to_string();
        }

        let key = session_key(user_id, room_id);
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("ask", request_id = %request_id, session_key = %key);
        let _entered = span.enter();
        let start = Instant::now();

        match self.sessions.cleanup_old_sessions(self.settings.ttl_hours) {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "expired session rows swept"),
            Err(e) => tracing::warn!(error = %e, "session cleanup failed"),
        }
        let context = self.sessions.get_conversation_context(&key).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not load conversation context, continuing without it");
            String::new()
        });

        let response = match FastPathCommand::classify(query) {
            Some(command) => {
                tracing::debug!(?command, "fast path");
                self.fast_path(command)
            }
            None if !self.state.is_ready() => {
                tracing::warn!("components not ready, rejecting complex query");
                NOT_READY_RESPONSE.to_string()
            }
            None => {
                let combined = format!("{context}{query}");
                let state = &self.state;
                self.recovery.guard(&combined, |input| state.execute_query(input))
            }
        };

        self.persist(&key, Role::User, query);
        self.persist(&key, Role::Assistant, &response);

        let elapsed = start.elapsed();
        if elapsed > self.settings.slow_request_warn {
            tracing::warn!(
                elapsed_secs = elapsed.as_secs_f64(),
                threshold_secs = self.settings.slow_request_warn.as_secs(),
                "slow request"
            );
        }
        response
    }

    fn persist(&self, key: &str, role: Role, content: &str) {
        if let Err(e) = self.sessions.add_message(key, role, content) {
            tracing::error!(role = %role, error = %e, "failed to persist message");
        }
    }

    fn fast_path(&self, command: FastPathCommand) -> String {
        match command {
            FastPathCommand::Status => self.status_response(),
            FastPathCommand::Greeting => GREETING_RESPONSE.to_string(),
            FastPathCommand::HealthTests => self.health_tests_response(),
        }
    }

    fn status_response(&self) -> String {
        let report = self.state.health_check();
        let mut text = match report.status {
            "healthy" => "I'm up and running. All components are healthy.".to_string(),
            "partial" => format!("I'm up and running with reduced capabilities. {}.", report.message),
            _ => "I'm online, but my components are not initialized yet, so I can only answer basic commands."
                .to_string(),
        };

        let snapshot = self.recovery.get_health_status();
        let unavailable: Vec<&str> = snapshot
            .capabilities
            .iter()
            .filter(|(_, h)| !h.available)
            .map(|(name, _)| name.as_str())
            .collect();
        if !unavailable.is_empty() {
            text.push_str(&format!(" Currently failing: {}.", unavailable.join(", ")));
        }
        if let Some((prompt, completion, total)) = self.state.token_usage().filter(|u| u.2 > 0) {
            text.push_str(&format!(
                " LLM usage so far: {total} tokens ({prompt} prompt, {completion} completion)."
            ));
        }
        text
    }

    fn health_tests_response(&self) -> String {
        let Some(runner) = &self.health_tests else {
            return "Health tests are not configured on this instance.".to_string();
        };
        match catch_unwind(AssertUnwindSafe(|| runner.run_all())) {
            Ok(Ok(results)) => format_summary(&results),
            Ok(Err(e)) => {
                let detail = format!("{e:#}");
                tracing::error!(error = %detail, "health test runner failed");
                format!("Health tests could not be run: {e}")
            }
            Err(_) => {
                tracing::error!("health test runner panicked");
                "Health tests could not be run: the test runner crashed.".to_string()
            }
        }
    }
}
