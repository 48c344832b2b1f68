//! Runbook 检索
//!
//! 将 docs_dir 下的 .md / .txt 文档分块、向量化后存入内存索引，按余弦相似度检索。
//! 属于可选初始化阶段：构建失败时 StateManager 以降级（partial）模式继续运行。

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::llm::{EmbeddingProvider, LlmError};

/// 检索错误
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] LlmError),

    #[error("No documents indexed from {0}")]
    Empty(String),
}

/// 文档检索接口
pub trait DocumentRetriever: Send + Sync {
    /// 返回最相关的 k 个片段（按分数降序）
    fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, RetrievalError>;

    /// 已索引的片段数
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 文档块
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    /// 来源文档（文件名）
    pub source_id: String,
}

/// 分块策略
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// 目标块大小（字符数）
    pub chunk_size: usize,
    /// 块之间的重叠（字符数）
    pub chunk_overlap: usize,
    /// 分隔符优先级（从高到低）
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            separators: vec![
                "\n\n".to_string(),
                "\n".to_string(),
                ". ".to_string(),
                " ".to_string(),
            ],
        }
    }
}

/// 文档分块器
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// 将文档分割为块（UTF-8 安全）；优先在分隔符处断开
    pub fn chunk(&self, doc_id: &str, text: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        let total_chars = chars.len();
        let chunk_size = self.config.chunk_size.max(1);

        let mut current_idx = 0;
        while current_idx < total_chars {
            let target_end = (current_idx + chunk_size).min(total_chars);
            let mut actual_end = target_end;

            if target_end < total_chars {
                let slice: String = chars[current_idx..target_end].iter().collect();
                for sep in &self.config.separators {
                    if let Some(pos) = slice.rfind(sep.as_str()) {
                        let chars_to_sep = slice[..pos].chars().count() + sep.chars().count();
                        if chars_to_sep > 0 {
                            actual_end = current_idx + chars_to_sep;
                            break;
                        }
                    }
                }
            }

            if actual_end <= current_idx {
                actual_end = (current_idx + 1).min(total_chars);
            }

            let chunk_text: String = chars[current_idx..actual_end].iter().collect();
            let trimmed = chunk_text.trim();
            if !trimmed.is_empty() {
                chunks.push(Chunk {
                    id: format!("{}_{}", doc_id, chunks.len()),
                    text: trimmed.to_string(),
                    source_id: doc_id.to_string(),
                });
            }

            let overlap = self.config.chunk_overlap.min(actual_end - current_idx);
            let next_start = actual_end.saturating_sub(overlap);
            current_idx = if next_start > current_idx {
                next_start
            } else {
                actual_end
            };
        }

        chunks
    }
}

/// 检索结果
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub score: f32,
}

/// 内存向量索引：(chunk, embedding)
pub struct RunbookIndex {
    entries: Vec<(Chunk, Vec<f32>)>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
}

impl RunbookIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, chunking: ChunkingConfig) -> Self {
        Self {
            entries: Vec::new(),
            embedder,
            chunker: Chunker::new(chunking),
        }
    }

    /// 索引目录下所有 .md / .txt 文件；一个片段都没有时返回 Empty
    pub fn from_dir(
        dir: &Path,
        embedder: Arc<dyn EmbeddingProvider>,
        chunking: ChunkingConfig,
    ) -> Result<Self, RetrievalError> {
        let mut index = Self::new(embedder, chunking);

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("md") | Some("txt")
                    )
            })
            .collect();
        paths.sort();

        for path in paths {
            let text = std::fs::read_to_string(&path)?;
            let doc_id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let added = index.index_document(&doc_id, &text)?;
            tracing::debug!(doc = %doc_id, chunks = added, "indexed runbook");
        }

        if index.entries.is_empty() {
            return Err(RetrievalError::Empty(dir.display().to_string()));
        }
        tracing::info!(chunks = index.entries.len(), dir = %dir.display(), "runbook index ready");
        Ok(index)
    }

    /// 索引文档（先删除同名旧版本），返回新增块数
    pub fn index_document(&mut self, doc_id: &str, text: &str) -> Result<usize, RetrievalError> {
        self.entries.retain(|(chunk, _)| chunk.source_id != doc_id);

        let mut added = 0;
        for chunk in self.chunker.chunk(doc_id, text) {
            let embedding = self.embedder.embed_sync(&chunk.text)?;
            if embedding.is_empty() {
                continue;
            }
            self.entries.push((chunk, embedding));
            added += 1;
        }
        Ok(added)
    }
}

impl DocumentRetriever for RunbookIndex {
    fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let query_embedding = self.embedder.embed_sync(query)?;
        if query_embedding.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<RetrievalResult> = self
            .entries
            .iter()
            .map(|(chunk, emb)| RetrievalResult {
                chunk: chunk.clone(),
                score: cosine_similarity(&query_embedding, emb),
            })
            .filter(|r| r.score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 余弦相似度
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockEmbedder;

    #[test]
    fn test_chunking() {
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 40,
            chunk_overlap: 5,
            ..Default::default()
        });
        let text = "Isolate the host first.\n\nThen collect memory. Then open a ticket for the IR team.";
        let chunks = chunker.chunk("doc1", text);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(!chunk.text.is_empty());
            assert!(chunk.text.chars().count() <= 40);
            assert_eq!(chunk.source_id, "doc1");
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.001);
        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[test]
    fn test_retrieve_ranks_matching_runbook_first() {
        let mut index = RunbookIndex::new(Arc::new(MockEmbedder::new(1024)), ChunkingConfig::default());
        index
            .index_document("phishing.md", "Phishing email triage: pull headers, detonate attachment")
            .unwrap();
        index
            .index_document("ransomware.md", "Ransomware response: isolate host, disable account")
            .unwrap();

        let results = index.retrieve("how do I isolate a ransomware host", 1).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.source_id, "ransomware.md");
    }

    #[test]
    fn test_reindex_replaces_document() {
        let mut index = RunbookIndex::new(Arc::new(MockEmbedder::default()), ChunkingConfig::default());
        index.index_document("a.md", "first version").unwrap();
        index.index_document("a.md", "second version").unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_from_dir_indexes_markdown_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("edr.md"), "EDR containment steps").unwrap();
        std::fs::write(dir.path().join("notes.bin"), "ignored binary").unwrap();
        let index = RunbookIndex::from_dir(
            dir.path(),
            Arc::new(MockEmbedder::default()),
            ChunkingConfig::default(),
        )
        .unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_from_empty_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = RunbookIndex::from_dir(
            dir.path(),
            Arc::new(MockEmbedder::default()),
            ChunkingConfig::default(),
        );
        assert!(matches!(result, Err(RetrievalError::Empty(_))));
    }
}
