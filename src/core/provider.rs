//! 组件工厂：按初始化阶段提供 LLM、嵌入、检索器与工具注册表
//!
//! StateManager 只负责阶段顺序与失败语义，具体组件由 ComponentProvider 构造；
//! 生产环境使用 ConfigComponentProvider，测试可注入任意实现。

use std::sync::Arc;

use anyhow::{bail, Context};

use crate::config::AppConfig;
use crate::llm::{EmbeddingProvider, LlmClient, MockEmbedder, MockLlmClient, OpenAiClient, OpenAiEmbedder};
use crate::memory::{ChunkingConfig, DocumentRetriever, RunbookIndex};
use crate::tools::{EchoTool, RunbookSearchTool, ToolCapability, ToolRegistry};

/// 组件工厂，每个方法对应一个初始化阶段
pub trait ComponentProvider: Send + Sync {
    /// core 阶段：校验配置、准备依赖
    fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn create_llm(&self) -> anyhow::Result<Arc<dyn LlmClient>>;

    fn create_embeddings(&self) -> anyhow::Result<Arc<dyn EmbeddingProvider>>;

    /// 可选阶段；Ok(None) 表示未启用
    fn create_retriever(
        &self,
        embeddings: Arc<dyn EmbeddingProvider>,
    ) -> anyhow::Result<Option<Arc<dyn DocumentRetriever>>>;

    fn create_tools(
        &self,
        retriever: Option<Arc<dyn DocumentRetriever>>,
    ) -> anyhow::Result<ToolRegistry>;
}

/// 根据 AppConfig 构造组件
pub struct ConfigComponentProvider {
    config: AppConfig,
    llm_override: Option<Arc<dyn LlmClient>>,
    extra_tools: Vec<Arc<dyn ToolCapability>>,
}

impl ConfigComponentProvider {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm_override: None,
            extra_tools: Vec::new(),
        }
    }

    /// 使用外部构造的 LLM 客户端（忽略 [llm] 段）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm_override = Some(llm);
        self
    }

    /// 追加外部工具（威胁情报、EDR 等集成由调用方持有）
    pub fn with_tool(mut self, tool: Arc<dyn ToolCapability>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

impl ComponentProvider for ConfigComponentProvider {
    fn prepare(&self) -> anyhow::Result<()> {
        if self.llm_override.is_none() {
            match self.config.llm.provider.as_str() {
                "openai" | "mock" => {}
                other => bail!("unknown llm provider '{other}' (expected openai or mock)"),
            }
        }
        if self.config.retrieval.enabled && self.config.retrieval.docs_dir.is_none() {
            tracing::warn!("retrieval enabled but retrieval.docs_dir is not set");
        }
        Ok(())
    }

    fn create_llm(&self) -> anyhow::Result<Arc<dyn LlmClient>> {
        if let Some(llm) = &self.llm_override {
            return Ok(llm.clone());
        }
        let llm = &self.config.llm;
        match llm.provider.as_str() {
            "openai" => {
                let client = OpenAiClient::new(
                    llm.base_url.as_deref(),
                    &llm.model,
                    llm.api_key.as_deref(),
                    llm.request_timeout_secs,
                    llm.temperature,
                )
                .context("building OpenAI-compatible client")?;
                Ok(Arc::new(client))
            }
            "mock" => Ok(Arc::new(MockLlmClient::new())),
            other => bail!("unknown llm provider '{other}'"),
        }
    }

    fn create_embeddings(&self) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
        if self.config.llm.provider == "openai" {
            let emb = &self.config.embeddings;
            let base_url = emb.base_url.as_deref().or(self.config.llm.base_url.as_deref());
            let api_key = emb.api_key.as_deref().or(self.config.llm.api_key.as_deref());
            let embedder = OpenAiEmbedder::new(
                base_url,
                &emb.model,
                api_key,
                self.config.llm.request_timeout_secs,
            )
            .context("building embeddings client")?;
            return Ok(Arc::new(embedder));
        }
        Ok(Arc::new(MockEmbedder::default()))
    }

    fn create_retriever(
        &self,
        embeddings: Arc<dyn EmbeddingProvider>,
    ) -> anyhow::Result<Option<Arc<dyn DocumentRetriever>>> {
        let retrieval = &self.config.retrieval;
        if !retrieval.enabled {
            return Ok(None);
        }
        let Some(dir) = &retrieval.docs_dir else {
            bail!("retrieval.docs_dir is not set");
        };
        let chunking = ChunkingConfig {
            chunk_size: retrieval.chunk_size,
            chunk_overlap: retrieval.chunk_overlap,
            ..Default::default()
        };
        let index = RunbookIndex::from_dir(dir, embeddings, chunking)
            .with_context(|| format!("indexing runbooks in {}", dir.display()))?;
        Ok(Some(Arc::new(index)))
    }

    fn create_tools(
        &self,
        retriever: Option<Arc<dyn DocumentRetriever>>,
    ) -> anyhow::Result<ToolRegistry> {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        if let Some(retriever) = retriever {
            tools.register(RunbookSearchTool::new(retriever, self.config.retrieval.top_k));
        }
        for tool in &self.extra_tools {
            tools.register_arc(tool.clone());
        }
        Ok(tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_provider_builds_default_tools() {
        let provider = ConfigComponentProvider::new(AppConfig::default());
        provider.prepare().unwrap();
        assert_eq!(provider.create_llm().unwrap().model_name(), "mock");
        let embeddings = provider.create_embeddings().unwrap();
        assert!(provider.create_retriever(embeddings).unwrap().is_none());
        let tools = provider.create_tools(None).unwrap();
        assert_eq!(tools.tool_names(), vec!["echo"]);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut config = AppConfig::default();
        config.llm.provider = "carrier-pigeon".to_string();
        let provider = ConfigComponentProvider::new(config);
        assert!(provider.prepare().is_err());
        assert!(provider.create_llm().is_err());
    }

    #[test]
    fn test_retriever_enabled_adds_search_tool() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("phishing.md"), "Report phishing to the SOC mailbox.").unwrap();
        let mut config = AppConfig::default();
        config.retrieval.enabled = true;
        config.retrieval.docs_dir = Some(dir.path().to_path_buf());
        let provider = ConfigComponentProvider::new(config);

        let embeddings = provider.create_embeddings().unwrap();
        let retriever = provider.create_retriever(embeddings).unwrap();
        assert!(retriever.is_some());
        let tools = provider.create_tools(retriever).unwrap();
        assert!(tools.contains("runbook_search"));
    }

    #[test]
    fn test_retriever_missing_dir_fails() {
        let mut config = AppConfig::default();
        config.retrieval.enabled = true;
        config.retrieval.docs_dir = Some("/nonexistent/socbot-runbooks".into());
        let provider = ConfigComponentProvider::new(config);
        let embeddings = provider.create_embeddings().unwrap();
        assert!(provider.create_retriever(embeddings).is_err());
    }
}
