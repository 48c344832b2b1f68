//! Runbook 检索工具：把可选的文档检索器暴露给 LLM

use std::sync::Arc;

use crate::memory::DocumentRetriever;
use crate::tools::{ToolCapability, ToolError};

pub struct RunbookSearchTool {
    retriever: Arc<dyn DocumentRetriever>,
    top_k: usize,
}

impl RunbookSearchTool {
    pub fn new(retriever: Arc<dyn DocumentRetriever>, top_k: usize) -> Self {
        Self {
            retriever,
            top_k: top_k.max(1),
        }
    }
}

impl ToolCapability for RunbookSearchTool {
    fn name(&self) -> &str {
        "runbook_search"
    }

    fn description(&self) -> &str {
        "Search the SOC runbooks and playbooks for procedures. Input: a short natural-language query."
    }

    fn run(&self, input: &str) -> Result<String, ToolError> {
        let query = input.trim();
        if query.is_empty() {
            return Ok("No query given; provide keywords to search the runbooks.".to_string());
        }

        let results = self
            .retriever
            .retrieve(query, self.top_k)
            .map_err(|e| ToolError::Transient(e.to_string()))?;

        if results.is_empty() {
            return Ok(format!("No runbook sections matched \"{query}\"."));
        }

        Ok(results
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "[{}] {} (score {:.2})\n{}",
                    i + 1,
                    r.chunk.source_id,
                    r.score,
                    r.chunk.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}
