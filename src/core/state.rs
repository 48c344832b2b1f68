//! 组件生命周期与单次工具调度
//!
//! StateManager 拥有 LLM、嵌入、可选检索器与工具注册表，按阶段初始化：
//!
//! 1. core：ComponentProvider::prepare（必需）
//! 2. llm / embeddings（必需）
//! 3. retrieval（可选，失败只记 warn，进入 partial 模式）
//! 4. tools（必需）
//!
//! 组件放在一把 RwLock 中：execute_query 全程持有读锁，reset_components / shutdown 取写锁，
//! 因此重置不会与进行中的查询交错。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::core::protocol::ParsedResponse;
use crate::core::provider::ComponentProvider;
use crate::core::{AgentError, CapabilityCategory, RecoveryManager};
use crate::llm::{EmbeddingProvider, LlmClient};
use crate::memory::{DocumentRetriever, Message};
use crate::observability::preview;
use crate::tools::{ToolExecutor, ToolRegistry};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are socbot, an assistant for security operations analysts. \
Answer questions about alerts, indicators, hosts, tickets and procedures concisely and accurately. \
If you are not sure, say so instead of guessing.";

/// 检索阶段的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStage {
    Disabled,
    Ready,
    Failed,
}

#[derive(Default)]
struct Components {
    llm: Option<Arc<dyn LlmClient>>,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    retriever: Option<Arc<dyn DocumentRetriever>>,
    tools: Option<ToolRegistry>,
    retrieval: Option<RetrievalStage>,
}

/// health_check 的返回值
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ready: bool,
    /// not_initialized / partial / healthy
    pub status: &'static str,
    pub message: String,
    pub components: BTreeMap<String, bool>,
}

pub struct StateManager {
    provider: Box<dyn ComponentProvider>,
    recovery: Arc<RecoveryManager>,
    executor: ToolExecutor,
    system_prompt: String,
    components: RwLock<Components>,
    initialized: AtomicBool,
}

impl StateManager {
    pub fn new(
        provider: impl ComponentProvider + 'static,
        recovery: Arc<RecoveryManager>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider: Box::new(provider),
            executor: ToolExecutor::new(recovery.clone()),
            recovery,
            system_prompt: system_prompt.into(),
            components: RwLock::new(Components::default()),
            initialized: AtomicBool::new(false),
        }
    }

    /// 按阶段初始化全部组件；只有必需阶段失败时返回 false。已初始化时直接返回 true
    pub fn initialize_all_components(&self) -> bool {
        let mut guard = self.components.write().unwrap_or_else(PoisonError::into_inner);
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }

        match self.run_stages() {
            Ok(components) => {
                if let Some(tools) = &components.tools {
                    self.recovery.register_capability("llm", CapabilityCategory::Llm);
                    for (name, category) in tools.categories() {
                        self.recovery.register_capability(&name, category);
                    }
                }
                *guard = components;
                self.initialized.store(true, Ordering::SeqCst);
                tracing::info!("all mandatory components initialized");
                true
            }
            Err(e) => {
                *guard = Components::default();
                self.initialized.store(false, Ordering::SeqCst);
                tracing::error!(error = %e, "component initialization failed");
                false
            }
        }
    }

    fn run_stages(&self) -> Result<Components, AgentError> {
        let stage_err = |stage: &'static str| {
            move |e: anyhow::Error| AgentError::InitializationFailed {
                stage,
                message: format!("{e:#}"),
            }
        };

        self.provider.prepare().map_err(stage_err("core"))?;
        tracing::info!(stage = "core", "stage complete");

        let llm = self.provider.create_llm().map_err(stage_err("llm"))?;
        tracing::info!(stage = "llm", model = llm.model_name(), "stage complete");

        let embeddings = self.provider.create_embeddings().map_err(stage_err("embeddings"))?;
        tracing::info!(stage = "embeddings", "stage complete");

        let (retriever, retrieval) = match self.provider.create_retriever(embeddings.clone()) {
            Ok(Some(r)) => {
                tracing::info!(stage = "retrieval", chunks = r.len(), "stage complete");
                (Some(r), RetrievalStage::Ready)
            }
            Ok(None) => {
                tracing::info!(stage = "retrieval", "disabled, skipping");
                (None, RetrievalStage::Disabled)
            }
            Err(e) => {
                let detail = format!("{e:#}");
                tracing::warn!(stage = "retrieval", error = %detail, "optional stage failed, continuing in partial mode");
                (None, RetrievalStage::Failed)
            }
        };

        let tools = self.provider.create_tools(retriever.clone()).map_err(stage_err("tools"))?;
        tracing::info!(stage = "tools", tools = ?tools.tool_names(), "stage complete");

        Ok(Components {
            llm: Some(llm),
            embeddings: Some(embeddings),
            retriever,
            tools: Some(tools),
            retrieval: Some(retrieval),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// 能否处理复杂路径请求
    pub fn is_ready(&self) -> bool {
        self.is_initialized()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let components = self.components.read().unwrap_or_else(PoisonError::into_inner);
        components.tools.as_ref().map(|t| t.tool_names()).unwrap_or_default()
    }

    /// 当前 LLM 的累计 token 使用；未初始化时为 None
    pub fn token_usage(&self) -> Option<(u64, u64, u64)> {
        let components = self.components.read().unwrap_or_else(PoisonError::into_inner);
        components.llm.as_ref().map(|llm| llm.token_usage())
    }

    pub fn retrieval_stage(&self) -> Option<RetrievalStage> {
        self.components.read().unwrap_or_else(PoisonError::into_inner).retrieval
    }

    /// 单次查询：一轮提示 → 可选的一次工具调用 → 第二轮自然语言回答。不循环
    pub fn execute_query(&self, query: &str) -> Result<String, AgentError> {
        let components = self.components.read().unwrap_or_else(PoisonError::into_inner);
        let (Some(llm), Some(tools)) = (components.llm.as_ref(), components.tools.as_ref()) else {
            return Err(AgentError::NotInitialized);
        };

        let mut messages = vec![Message::system(self.build_prompt(tools)), Message::user(query)];
        let first = self.recovery.with_retry("llm", || llm.complete(&messages))?;

        let (name, argument) = match ParsedResponse::parse(&first) {
            ParsedResponse::Direct(_) => return Ok(first),
            ParsedResponse::ToolCall { name, argument } => (name, argument),
        };
        let Some(tool) = tools.get(&name) else {
            tracing::warn!(tool = %name, "LLM named an unregistered tool, returning completion as is");
            return Ok(first);
        };

        tracing::debug!(tool = %name, argument = %preview(&argument, 120), "dispatching tool call");
        let observation = match self.executor.invoke(tool.as_ref(), &argument) {
            Ok(observation) => observation,
            Err(e) => {
                tracing::warn!(error = %e, "tool failed, serving category fallback");
                return Ok(self.recovery.get_fallback_response(tool.category(), Some(query)));
            }
        };

        messages.push(Message::assistant(first));
        messages.push(Message::user(format!(
            "Observation: {observation}\n\n\
             Using this observation, answer the original question in plain language. \
             Do not call another tool."
        )));
        let answer = self.recovery.with_retry("llm", || llm.complete(&messages))?;
        Ok(answer)
    }

    fn build_prompt(&self, tools: &ToolRegistry) -> String {
        format!(
            "{system}\n\n\
             You can use the following tools:\n{described}\n\n\
             Available tool names: {names}\n\n\
             To use a tool, reply with exactly these two lines and nothing else:\n\
             Action: <tool name>\n\
             Action Input: <input for the tool>\n\n\
             Use at most one tool. If no tool is needed, answer directly.",
            system = self.system_prompt,
            described = tools.describe(),
            names = tools.tool_names().join(", "),
        )
    }

    /// 组件存在性检查；检索未启用时不计入
    pub fn health_check(&self) -> HealthReport {
        let components = self.components.read().unwrap_or_else(PoisonError::into_inner);
        let initialized = self.is_initialized();

        let mut checks = BTreeMap::new();
        checks.insert("llm".to_string(), components.llm.is_some());
        checks.insert("embeddings".to_string(), components.embeddings.is_some());
        checks.insert("tools".to_string(), components.tools.is_some());
        if !matches!(components.retrieval, Some(RetrievalStage::Disabled)) {
            checks.insert("retriever".to_string(), components.retriever.is_some());
        }

        let (status, message) = if !initialized {
            ("not_initialized", "Components are not initialized".to_string())
        } else if checks.values().all(|ok| *ok) {
            ("healthy", "All components initialized".to_string())
        } else {
            let missing: Vec<&str> = checks
                .iter()
                .filter(|(_, ok)| !**ok)
                .map(|(name, _)| name.as_str())
                .collect();
            ("partial", format!("Running in degraded mode, unavailable: {}", missing.join(", ")))
        };

        HealthReport {
            ready: initialized,
            status,
            message,
            components: checks,
        }
    }

    /// 丢弃所有组件引用；可重复调用。等待进行中的查询释放读锁后执行
    pub fn reset_components(&self) {
        let mut guard = self.components.write().unwrap_or_else(PoisonError::into_inner);
        let was_initialized = self.initialized.swap(false, Ordering::SeqCst);
        *guard = Components::default();
        self.recovery.clear_capabilities();
        if was_initialized {
            tracing::info!("components reset");
        }
    }

    /// 关闭：与 reset_components 相同的锁语义，可从信号处理线程、监管者或测试中调用
    pub fn shutdown(&self) {
        tracing::info!("state manager shutting down");
        self.reset_components();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::ConfigComponentProvider;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::memory::Role;
    use crate::tools::{ToolCapability, ToolError};
    use std::sync::{mpsc, Mutex};
    use std::time::Duration;

    struct IpLookup;

    impl ToolCapability for IpLookup {
        fn name(&self) -> &str {
            "ip_lookup"
        }

        fn description(&self) -> &str {
            "Reputation for an IPv4 address."
        }

        fn category(&self) -> CapabilityCategory {
            CapabilityCategory::ThreatIntel
        }

        fn run(&self, input: &str) -> Result<String, ToolError> {
            Ok(format!("{input} is listed as a known C2 node"))
        }
    }

    struct Broken;

    impl ToolCapability for Broken {
        fn name(&self) -> &str {
            "ticket_lookup"
        }

        fn description(&self) -> &str {
            "Look up a ticket."
        }

        fn category(&self) -> CapabilityCategory {
            CapabilityCategory::Ticketing
        }

        fn run(&self, _input: &str) -> Result<String, ToolError> {
            Err(ToolError::Failed("401 Unauthorized".into()))
        }
    }

    /// 进入 complete 后通知测试线程，并阻塞到测试线程放行
    struct GatedLlm {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl LlmClient for GatedLlm {
        fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            if let Ok(entered) = self.entered.lock() {
                let _ = entered.send(());
            }
            if let Ok(release) = self.release.lock() {
                let _ = release.recv();
            }
            Ok("Contain the host first.".into())
        }
    }

    struct FailingLlm;

    impl ComponentProvider for FailingLlm {
        fn create_llm(&self) -> anyhow::Result<Arc<dyn LlmClient>> {
            anyhow::bail!("no API key")
        }

        fn create_embeddings(&self) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
            Ok(Arc::new(crate::llm::MockEmbedder::default()))
        }

        fn create_retriever(
            &self,
            _embeddings: Arc<dyn EmbeddingProvider>,
        ) -> anyhow::Result<Option<Arc<dyn DocumentRetriever>>> {
            Ok(None)
        }

        fn create_tools(
            &self,
            _retriever: Option<Arc<dyn DocumentRetriever>>,
        ) -> anyhow::Result<ToolRegistry> {
            Ok(ToolRegistry::new())
        }
    }

    fn manager(llm: Arc<MockLlmClient>) -> StateManager {
        let provider = ConfigComponentProvider::new(AppConfig::default())
            .with_llm(llm)
            .with_tool(Arc::new(IpLookup))
            .with_tool(Arc::new(Broken));
        let state = StateManager::new(provider, Arc::new(RecoveryManager::default()), DEFAULT_SYSTEM_PROMPT);
        assert!(state.initialize_all_components());
        state
    }

    #[test]
    fn test_initialize_and_health() {
        let state = manager(Arc::new(MockLlmClient::new()));
        assert!(state.is_ready());
        assert!(state.initialize_all_components());
        let report = state.health_check();
        assert!(report.ready);
        assert_eq!(report.status, "healthy");
        assert!(!report.components.contains_key("retriever"));
        assert_eq!(state.retrieval_stage(), Some(RetrievalStage::Disabled));
    }

    #[test]
    fn test_mandatory_stage_failure() {
        let state = StateManager::new(FailingLlm, Arc::new(RecoveryManager::default()), "");
        assert!(!state.initialize_all_components());
        assert!(!state.is_ready());
        assert_eq!(state.health_check().status, "not_initialized");
        assert!(matches!(state.execute_query("hi"), Err(AgentError::NotInitialized)));
    }

    #[test]
    fn test_optional_retrieval_failure_is_partial() {
        let mut config = AppConfig::default();
        config.retrieval.enabled = true;
        config.retrieval.docs_dir = Some("/nonexistent/socbot-runbooks".into());
        let state = StateManager::new(
            ConfigComponentProvider::new(config),
            Arc::new(RecoveryManager::default()),
            "",
        );
        assert!(state.initialize_all_components());
        let report = state.health_check();
        assert!(report.ready);
        assert_eq!(report.status, "partial");
        assert_eq!(report.components.get("retriever"), Some(&false));
        assert_eq!(state.retrieval_stage(), Some(RetrievalStage::Failed));
    }

    #[test]
    fn test_direct_answer_returned_unmodified() {
        let llm = Arc::new(MockLlmClient::scripted(vec![Ok("Rotate the credentials.".into())]));
        let state = manager(llm.clone());
        assert_eq!(state.execute_query("what now?").unwrap(), "Rotate the credentials.");
        assert_eq!(llm.call_count(), 1);

        let prompt = &llm.call(0).unwrap()[0];
        assert_eq!(prompt.role, Role::System);
        assert!(prompt.content.contains("Available tool names: echo, ip_lookup, ticket_lookup"));
        assert!(prompt.content.contains("- ip_lookup: Reputation for an IPv4 address."));
    }

    #[test]
    fn test_single_tool_call_then_second_pass() {
        let llm = Arc::new(MockLlmClient::scripted(vec![
            Ok("Action: ip_lookup\nAction Input: 198.51.100.9".into()),
            Ok("That IP is a known C2 node; block it.".into()),
            Ok("Action: ip_lookup\nAction Input: again".into()),
        ]));
        let state = manager(llm.clone());
        let answer = state.execute_query("is 198.51.100.9 bad?").unwrap();
        assert_eq!(answer, "That IP is a known C2 node; block it.");
        assert_eq!(llm.call_count(), 2);

        let second = llm.call(1).unwrap();
        let observation = &second.last().unwrap().content;
        assert!(observation.starts_with("Observation: 198.51.100.9 is listed as a known C2 node"));
    }

    #[test]
    fn test_unknown_tool_returns_first_completion() {
        let raw = "Action: splunk_search\nAction Input: index=main";
        let llm = Arc::new(MockLlmClient::scripted(vec![Ok(raw.into())]));
        let state = manager(llm.clone());
        assert_eq!(state.execute_query("search splunk").unwrap(), raw);
        assert_eq!(llm.call_count(), 1);
    }

    #[test]
    fn test_tool_failure_serves_category_fallback() {
        let llm = Arc::new(MockLlmClient::scripted(vec![Ok(
            "Action: ticket_lookup\nAction Input: INC-1".into(),
        )]));
        let state = manager(llm.clone());
        let out = state.execute_query("status of INC-1").unwrap();
        let recovery = RecoveryManager::default();
        assert_eq!(out, recovery.get_fallback_response(CapabilityCategory::Ticketing, None));
        assert_eq!(llm.call_count(), 1);
    }

    #[test]
    fn test_llm_error_propagates() {
        let llm = Arc::new(MockLlmClient::scripted(vec![Err(LlmError::InvalidResponse(
            "empty choices".into(),
        ))]));
        let state = manager(llm);
        assert!(matches!(state.execute_query("q"), Err(AgentError::Llm(_))));
    }

    #[test]
    fn test_reset_is_idempotent() {
        let state = manager(Arc::new(MockLlmClient::new()));
        state.reset_components();
        state.reset_components();
        state.shutdown();
        assert!(!state.is_ready());
        assert!(state.tool_names().is_empty());
        assert_eq!(state.health_check().status, "not_initialized");
        assert!(matches!(state.execute_query("q"), Err(AgentError::NotInitialized)));

        assert!(state.initialize_all_components());
        assert!(state.is_ready());
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_query() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let llm = Arc::new(GatedLlm {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let provider = ConfigComponentProvider::new(AppConfig::default()).with_llm(llm);
        let state = StateManager::new(provider, Arc::new(RecoveryManager::default()), "");
        assert!(state.initialize_all_components());
        let shut_down = AtomicBool::new(false);

        let (answer, blocked) = std::thread::scope(|scope| {
            let query = scope.spawn(|| state.execute_query("WS-7 is beaconing"));
            entered_rx.recv().unwrap();

            let shutdown = scope.spawn(|| {
                state.shutdown();
                shut_down.store(true, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(100));
            // 只读原子量：写锁排队时再取读锁会被阻塞
            let blocked = !shut_down.load(Ordering::SeqCst) && state.is_ready();

            release_tx.send(()).unwrap();
            let answer = query.join().unwrap();
            shutdown.join().unwrap();
            (answer, blocked)
        });

        assert!(blocked);
        assert_eq!(answer.unwrap(), "Contain the host first.");
        assert!(shut_down.load(Ordering::SeqCst));
        assert!(!state.is_ready());
        assert!(matches!(state.execute_query("q"), Err(AgentError::NotInitialized)));
    }
}
