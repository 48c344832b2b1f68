//! 记忆层：对话消息模型、持久化会话存储、可选的 Runbook 检索

pub mod conversation;
pub mod retriever;
pub mod session_store;

pub use conversation::{session_key, Message, Role, StoredMessage};
pub use retriever::{
    Chunk, Chunker, ChunkingConfig, DocumentRetriever, RetrievalError, RetrievalResult, RunbookIndex,
};
pub use session_store::{
    SessionError, SessionInfo, SessionLimits, SessionStore, SqliteSessionStore,
};
