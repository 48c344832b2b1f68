//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SOCBOT__*` 覆盖（双下划线表示嵌套，如 `SOCBOT__LLM__PROVIDER=openai`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub embeddings: EmbeddingsSection,
    pub retrieval: RetrievalSection,
    pub session: SessionSection,
    pub recovery: RecoverySection,
    pub dispatcher: DispatcherSection,
}

/// [app] 段：机器人名称与可剥离的前缀
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 聊天平台中 @ 机器人时附带的前缀，匹配时不区分大小写
    pub bot_names: Vec<String>,
    /// 覆盖内置系统提示词
    pub system_prompt: Option<String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "socbot".to_string(),
            bot_names: vec!["@socbot".to_string(), "socbot".to_string()],
            system_prompt: None,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub temperature: f32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            request_timeout_secs: 60,
            temperature: 0.0,
        }
    }
}

/// [embeddings] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingsSection {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for EmbeddingsSection {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            base_url: None,
            api_key: None,
        }
    }
}

/// [retrieval] 段：可选的 Runbook 检索（失败不阻塞初始化）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    pub enabled: bool,
    pub docs_dir: Option<PathBuf>,
    pub top_k: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            enabled: false,
            docs_dir: None,
            top_k: 3,
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

/// [session] 段：会话库路径与上下文窗口限制
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// SQLite 文件路径，`:memory:` 表示内存库
    pub db_path: PathBuf,
    pub max_messages_per_session: usize,
    pub max_context_messages: usize,
    pub max_context_chars: usize,
    pub ttl_hours: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/conversations.db"),
            max_messages_per_session: 30,
            max_context_messages: 20,
            max_context_chars: 4000,
            ttl_hours: 24,
        }
    }
}

/// [recovery] 段：重试退避参数与兜底文案覆盖
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// 按能力类别（threat_intel / edr / llm ...）覆盖重试策略
    pub policies: HashMap<String, RetryPolicySection>,
    /// 按能力类别覆盖兜底文案
    pub fallback_messages: HashMap<String, String>,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 8000,
            policies: HashMap::new(),
            fallback_messages: HashMap::new(),
        }
    }
}

/// [recovery.policies.<category>] 段；未设置的字段沿用 [recovery] 的值
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RetryPolicySection {
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub max_backoff_ms: Option<u64>,
}

/// [dispatcher] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    /// 超过该秒数只记 warn，不取消请求
    pub slow_request_warn_secs: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            slow_request_warn_secs: 25,
        }
    }
}

/// 从 config 目录加载配置，环境变量 SOCBOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SOCBOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SOCBOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_limits() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.session.max_messages_per_session, 30);
        assert_eq!(cfg.session.max_context_messages, 20);
        assert_eq!(cfg.session.max_context_chars, 4000);
        assert_eq!(cfg.session.ttl_hours, 24);
        assert_eq!(cfg.dispatcher.slow_request_warn_secs, 25);
        assert_eq!(cfg.llm.provider, "mock");
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socbot.toml");
        std::fs::write(
            &path,
            r#"
[session]
max_messages_per_session = 10

[recovery]
max_retries = 5

[recovery.policies.threat_intel]
max_retries = 1

[recovery.fallback_messages]
edr = "EDR is down."
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.session.max_messages_per_session, 10);
        assert_eq!(cfg.session.max_context_chars, 4000);
        assert_eq!(cfg.recovery.max_retries, 5);
        assert_eq!(
            cfg.recovery.policies.get("threat_intel").and_then(|p| p.max_retries),
            Some(1)
        );
        assert_eq!(
            cfg.recovery.fallback_messages.get("edr").map(String::as_str),
            Some("EDR is down.")
        );
    }
}
