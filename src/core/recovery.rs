//! 错误恢复管理
//!
//! RecoveryManager 是 LLM / 工具层与用户可见输出之间的韧性边界：
//! - `with_retry`：对瞬时失败按类别策略指数退避重试，耗尽后把错误交还调用方
//! - `get_fallback_response`：按能力类别返回确定性的兜底文案
//! - `guard`：唯一的收口点，任何错误（含 panic）都转成 general 兜底文案，绝不向上抛
//! - `get_health_status`：按能力记录可用性，供 status 快速通道展示

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{RecoverySection, RetryPolicySection};

/// 可判断是否值得重试的错误
pub trait Retryable {
    fn is_transient(&self) -> bool;

    /// 上游要求的最短等待（如 429 的 Retry-After）
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// 能力类别：每个集成族一个，外加兜底的 general
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    ThreatIntel,
    Edr,
    UrlFiltering,
    Ticketing,
    Llm,
    General,
}

impl CapabilityCategory {
    pub const ALL: [CapabilityCategory; 6] = [
        CapabilityCategory::ThreatIntel,
        CapabilityCategory::Edr,
        CapabilityCategory::UrlFiltering,
        CapabilityCategory::Ticketing,
        CapabilityCategory::Llm,
        CapabilityCategory::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityCategory::ThreatIntel => "threat_intel",
            CapabilityCategory::Edr => "edr",
            CapabilityCategory::UrlFiltering => "url_filtering",
            CapabilityCategory::Ticketing => "ticketing",
            CapabilityCategory::Llm => "llm",
            CapabilityCategory::General => "general",
        }
    }

    fn default_fallback(&self) -> &'static str {
        match self {
            CapabilityCategory::ThreatIntel => {
                "Sorry, threat intelligence lookups are temporarily unavailable. \
                 Please check the indicator directly in the threat-intel portal and try again later."
            }
            CapabilityCategory::Edr => {
                "Sorry, the EDR integration is temporarily unavailable. \
                 Please check host and detection details in the EDR console."
            }
            CapabilityCategory::UrlFiltering => {
                "Sorry, URL filtering lookups are temporarily unavailable. \
                 Please check the URL category in the web proxy console."
            }
            CapabilityCategory::Ticketing => {
                "Sorry, the ticketing system is temporarily unavailable. \
                 Please check the incident queue directly."
            }
            CapabilityCategory::Llm => {
                "Sorry, the language model is not responding right now. Please try again shortly."
            }
            CapabilityCategory::General => {
                "Sorry, I ran into a problem answering that. \
                 Please try again in a moment or rephrase your question."
            }
        }
    }
}

impl fmt::Display for CapabilityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapabilityCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown capability category: {s}"))
    }
}

/// 重试策略：最多 max_retries 次重试（总尝试次数 = max_retries + 1），第 n 次重试前等待
/// `initial_backoff * multiplier^n`，不超过 max_backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    /// 不重试
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 第 retry 次重试（从 0 开始）前的等待时间
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let secs = (self.initial_backoff.as_secs_f64() * factor).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// 取策略退避与上游等待提示中的较大者，仍不超过 max_backoff
    pub fn delay_with_hint(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let delay = self.delay_for(retry);
        match hint {
            Some(hint) => delay.max(hint.min(self.max_backoff)),
            None => delay,
        }
    }

    fn overridden_by(&self, section: &RetryPolicySection) -> Self {
        Self {
            max_retries: section.max_retries.unwrap_or(self.max_retries),
            initial_backoff: section
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(self.initial_backoff),
            multiplier: section.backoff_multiplier.unwrap_or(self.multiplier),
            max_backoff: section
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(self.max_backoff),
        }
    }
}

/// 恢复配置：默认策略、按类别的策略覆盖、兜底文案覆盖
#[derive(Debug, Clone, Default)]
pub struct RecoveryConfig {
    pub default_policy: RetryPolicy,
    pub policies: HashMap<CapabilityCategory, RetryPolicy>,
    pub fallback_messages: HashMap<CapabilityCategory, String>,
}

impl From<&RecoverySection> for RecoveryConfig {
    fn from(section: &RecoverySection) -> Self {
        let default_policy = RetryPolicy {
            max_retries: section.max_retries,
            initial_backoff: Duration::from_millis(section.initial_backoff_ms),
            multiplier: section.backoff_multiplier,
            max_backoff: Duration::from_millis(section.max_backoff_ms),
        };

        let mut policies = HashMap::new();
        for (name, overrides) in &section.policies {
            match name.parse::<CapabilityCategory>() {
                Ok(category) => {
                    policies.insert(category, default_policy.overridden_by(overrides));
                }
                Err(e) => tracing::warn!(error = %e, "ignoring retry policy override"),
            }
        }

        let mut fallback_messages = HashMap::new();
        for (name, text) in &section.fallback_messages {
            match name.parse::<CapabilityCategory>() {
                Ok(category) => {
                    fallback_messages.insert(category, text.clone());
                }
                Err(e) => tracing::warn!(error = %e, "ignoring fallback message override"),
            }
        }

        Self {
            default_policy,
            policies,
            fallback_messages,
        }
    }
}

/// 单个能力的健康记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityHealth {
    pub category: CapabilityCategory,
    pub available: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_at: Option<String>,
}

impl CapabilityHealth {
    fn new(category: CapabilityCategory) -> Self {
        Self {
            category,
            available: true,
            consecutive_failures: 0,
            last_error: None,
            last_success_at: None,
        }
    }
}

/// 健康快照
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: String,
    /// healthy / degraded
    pub overall: &'static str,
    pub capabilities: BTreeMap<String, CapabilityHealth>,
}

impl HealthSnapshot {
    pub fn is_available(&self, capability: &str) -> Option<bool> {
        self.capabilities.get(capability).map(|h| h.available)
    }
}

/// 恢复管理器；策略无状态，唯一的可变状态是按能力的健康记录
#[derive(Debug, Default)]
pub struct RecoveryManager {
    config: RecoveryConfig,
    health: Mutex<BTreeMap<String, CapabilityHealth>>,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            health: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_section(section: &RecoverySection) -> Self {
        Self::new(RecoveryConfig::from(section))
    }

    /// 登记能力（初始为可用）；已登记的只更新类别
    pub fn register_capability(&self, name: &str, category: CapabilityCategory) {
        if let Ok(mut health) = self.health.lock() {
            health
                .entry(name.to_string())
                .and_modify(|h| h.category = category)
                .or_insert_with(|| CapabilityHealth::new(category));
        }
    }

    /// 清空能力登记（组件重置时调用）
    pub fn clear_capabilities(&self) {
        if let Ok(mut health) = self.health.lock() {
            health.clear();
        }
    }

    pub fn category_of(&self, capability: &str) -> CapabilityCategory {
        let registered = self
            .health
            .lock()
            .ok()
            .and_then(|h| h.get(capability).map(|c| c.category));
        match registered {
            Some(category) => category,
            None if capability == "llm" => CapabilityCategory::Llm,
            None => CapabilityCategory::General,
        }
    }

    pub fn policy_for(&self, capability: &str) -> RetryPolicy {
        let category = self.category_of(capability);
        self.config
            .policies
            .get(&category)
            .copied()
            .unwrap_or(self.config.default_policy)
    }

    /// 执行 op；瞬时失败按策略退避重试，永久失败或重试耗尽时返回最后一次错误
    pub fn with_retry<T, E, F>(&self, capability: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Retryable + fmt::Display,
    {
        let policy = self.policy_for(capability);
        let mut retries = 0u32;
        loop {
            match op() {
                Ok(value) => {
                    self.record_success(capability);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && retries < policy.max_retries => {
                    let delay = policy.delay_with_hint(retries, e.retry_after());
                    retries += 1;
                    tracing::warn!(
                        capability,
                        retry = retries,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    tracing::error!(capability, attempts = retries + 1, error = %e, "capability call failed");
                    self.record_failure(capability, &e.to_string());
                    return Err(e);
                }
            }
        }
    }

    /// 按类别的确定性兜底文案；query 只用于日志
    pub fn get_fallback_response(&self, category: CapabilityCategory, query: Option<&str>) -> String {
        if let Some(q) = query {
            tracing::debug!(
                category = %category,
                query = %crate::observability::preview(q, 80),
                "serving fallback response"
            );
        }
        self.config
            .fallback_messages
            .get(&category)
            .cloned()
            .unwrap_or_else(|| category.default_fallback().to_string())
    }

    pub fn get_health_status(&self) -> HealthSnapshot {
        let capabilities = self.health.lock().map(|h| h.clone()).unwrap_or_default();
        let overall = if capabilities.values().all(|h| h.available) {
            "healthy"
        } else {
            "degraded"
        };
        HealthSnapshot {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            overall,
            capabilities,
        }
    }

    /// 韧性收口：调用 query_fn(input)，Err 或 panic 时记录日志并返回 general 兜底文案
    pub fn guard<F, E>(&self, input: &str, query_fn: F) -> String
    where
        F: FnOnce(&str) -> Result<String, E>,
        E: fmt::Display,
    {
        match catch_unwind(AssertUnwindSafe(|| query_fn(input))) {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "agent query failed, serving fallback");
                self.get_fallback_response(CapabilityCategory::General, Some(input))
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(panic = %detail, "agent query panicked, serving fallback");
                self.get_fallback_response(CapabilityCategory::General, Some(input))
            }
        }
    }

    fn record_success(&self, capability: &str) {
        let category = self.category_of(capability);
        if let Ok(mut health) = self.health.lock() {
            let entry = health
                .entry(capability.to_string())
                .or_insert_with(|| CapabilityHealth::new(category));
            if !entry.available {
                tracing::info!(capability, "capability recovered");
            }
            entry.available = true;
            entry.consecutive_failures = 0;
            entry.last_success_at = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        }
    }

    fn record_failure(&self, capability: &str, error: &str) {
        let category = self.category_of(capability);
        if let Ok(mut health) = self.health.lock() {
            let entry = health
                .entry(capability.to_string())
                .or_insert_with(|| CapabilityHealth::new(category));
            entry.available = false;
            entry.consecutive_failures += 1;
            entry.last_error = Some(error.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error (transient={})", self.transient)
        }
    }

    impl Retryable for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    /// 带上游等待提示的瞬时错误
    #[derive(Debug)]
    struct Throttled(Duration);

    impl fmt::Display for Throttled {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "throttled for {:?}", self.0)
        }
    }

    impl Retryable for Throttled {
        fn is_transient(&self) -> bool {
            true
        }

        fn retry_after(&self) -> Option<Duration> {
            Some(self.0)
        }
    }

    fn fast_manager(max_retries: u32) -> RecoveryManager {
        RecoveryManager::new(RecoveryConfig {
            default_policy: RetryPolicy {
                max_retries,
                initial_backoff: Duration::from_millis(1),
                multiplier: 2.0,
                max_backoff: Duration::from_millis(4),
            },
            ..RecoveryConfig::default()
        })
    }

    #[test]
    fn test_retry_until_success() {
        let manager = fast_manager(3);
        let calls = Cell::new(0);
        let result: Result<&str, TestError> = manager.with_retry("ioc_lookup", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(TestError { transient: true })
            } else {
                Ok("ok")
            }
        });
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.get(), 3);
        assert_eq!(manager.get_health_status().is_available("ioc_lookup"), Some(true));
    }

    #[test]
    fn test_retry_exhaustion_propagates() {
        let manager = fast_manager(2);
        let calls = Cell::new(0);
        let result: Result<(), TestError> = manager.with_retry("edr", || {
            calls.set(calls.get() + 1);
            Err(TestError { transient: true })
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
        let snapshot = manager.get_health_status();
        assert_eq!(snapshot.is_available("edr"), Some(false));
        assert_eq!(snapshot.overall, "degraded");
        assert_eq!(snapshot.capabilities["edr"].consecutive_failures, 1);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let manager = fast_manager(5);
        let calls = Cell::new(0);
        let result: Result<(), TestError> = manager.with_retry("edr", || {
            calls.set(calls.get() + 1);
            Err(TestError { transient: false })
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_success_restores_availability() {
        let manager = fast_manager(0);
        let _: Result<(), TestError> = manager.with_retry("edr", || Err(TestError { transient: true }));
        assert_eq!(manager.get_health_status().is_available("edr"), Some(false));
        let _: Result<(), TestError> = manager.with_retry("edr", || Ok(()));
        let snapshot = manager.get_health_status();
        assert_eq!(snapshot.is_available("edr"), Some(true));
        assert_eq!(snapshot.capabilities["edr"].consecutive_failures, 0);
        assert_eq!(snapshot.overall, "healthy");
    }

    #[test]
    fn test_retry_after_hint_raises_delay_up_to_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(8000),
        };
        assert_eq!(policy.delay_with_hint(0, None), Duration::from_millis(500));
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_millis(3000))),
            Duration::from_millis(3000)
        );
        assert_eq!(
            policy.delay_with_hint(2, Some(Duration::from_millis(100))),
            Duration::from_millis(2000)
        );
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_secs(u64::MAX))),
            Duration::from_millis(8000)
        );
    }

    #[test]
    fn test_with_retry_waits_for_server_hint() {
        let manager = RecoveryManager::new(RecoveryConfig {
            default_policy: RetryPolicy {
                max_retries: 1,
                initial_backoff: Duration::from_millis(1),
                multiplier: 2.0,
                max_backoff: Duration::from_millis(500),
            },
            ..RecoveryConfig::default()
        });
        let calls = Cell::new(0);
        let start = std::time::Instant::now();
        let result: Result<&str, Throttled> = manager.with_retry("llm", || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(Throttled(Duration::from_millis(60)))
            } else {
                Ok("ok")
            }
        });
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.get(), 2);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(3000),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(30), Duration::from_millis(3000));
    }

    #[test]
    fn test_policy_per_category_from_config() {
        let mut section = RecoverySection::default();
        section.max_retries = 4;
        section.policies.insert(
            "threat_intel".to_string(),
            RetryPolicySection {
                max_retries: Some(1),
                ..Default::default()
            },
        );
        section.policies.insert("bogus".to_string(), RetryPolicySection::default());

        let manager = RecoveryManager::from_section(&section);
        manager.register_capability("vt_lookup", CapabilityCategory::ThreatIntel);
        manager.register_capability("echo", CapabilityCategory::General);

        assert_eq!(manager.policy_for("vt_lookup").max_retries, 1);
        assert_eq!(manager.policy_for("vt_lookup").initial_backoff, Duration::from_millis(500));
        assert_eq!(manager.policy_for("echo").max_retries, 4);
        assert_eq!(manager.policy_for("unregistered").max_retries, 4);
    }

    #[test]
    fn test_fallbacks_are_deterministic_and_overridable() {
        let mut section = RecoverySection::default();
        section
            .fallback_messages
            .insert("edr".to_string(), "EDR down, use the console.".to_string());
        let manager = RecoveryManager::from_section(&section);

        assert_eq!(
            manager.get_fallback_response(CapabilityCategory::Edr, None),
            "EDR down, use the console."
        );
        let general_a = manager.get_fallback_response(CapabilityCategory::General, Some("a"));
        let general_b = manager.get_fallback_response(CapabilityCategory::General, Some("b"));
        assert_eq!(general_a, general_b);
        for category in CapabilityCategory::ALL {
            assert!(!manager.get_fallback_response(category, None).is_empty());
        }
    }

    #[test]
    fn test_guard_never_raises() {
        let manager = fast_manager(0);
        let general = manager.get_fallback_response(CapabilityCategory::General, None);

        let ok = manager.guard("q", |input| Ok::<_, TestError>(format!("answer to {input}")));
        assert_eq!(ok, "answer to q");

        let failed = manager.guard("q", |_| Err::<String, _>(TestError { transient: false }));
        assert_eq!(failed, general);

        let panicked = manager.guard("q", |_| -> Result<String, TestError> { panic!("tool blew up") });
        assert_eq!(panicked, general);
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("url_filtering".parse::<CapabilityCategory>().unwrap(), CapabilityCategory::UrlFiltering);
        assert!("dns".parse::<CapabilityCategory>().is_err());
        assert_eq!(CapabilityCategory::ThreatIntel.to_string(), "threat_intel");
    }
}
