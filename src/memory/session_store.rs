//! 会话存储
//!
//! SessionStore 定义 Dispatcher 依赖的会话接口；SqliteSessionStore 是基于单表 `conversations`
//! 的持久化实现：
//! - 写入与剪枝在同一事务内完成，单会话行数不超过 `max_messages_per_session`
//! - 会话内顺序即写入顺序（自增 id）；导出、上下文与剪枝都按 id 排序
//! - 上下文窗口从最新消息向前贪心累加，超出字符预算即停止，再恢复时间顺序
//! - TTL 清理由调用方在请求路径上惰性触发，不依赖后台定时器
//!
//! 连接由 Mutex 保护，任意两次写入不会交错（无撕裂写、无丢失剪枝）。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use crate::config::SessionSection;
use crate::memory::{Role, StoredMessage};

/// 上下文窗口头尾标记
pub const CONTEXT_HEADER: &str = "=== Previous conversation ===\n";
pub const CONTEXT_FOOTER: &str = "=== End of previous conversation ===\n\n";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_key TEXT NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_key);
CREATE INDEX IF NOT EXISTS idx_conversations_session_time ON conversations(session_key, timestamp DESC);
";

/// 会话存储错误
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Session store lock poisoned")]
    LockPoisoned,

    #[error("Role '{0}' cannot be stored in a session")]
    InvalidRole(Role),

    #[error("Corrupt session row: {0}")]
    CorruptRow(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 会话统计：单会话或全局汇总
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum SessionInfo {
    Session {
        session_key: String,
        message_count: usize,
        first_message_at: Option<String>,
        last_message_at: Option<String>,
    },
    Global {
        total_sessions: usize,
        total_messages: usize,
        oldest_message_at: Option<String>,
        newest_message_at: Option<String>,
    },
}

impl SessionInfo {
    /// 单会话为该会话行数，全局为总行数
    pub fn message_count(&self) -> usize {
        match self {
            SessionInfo::Session { message_count, .. } => *message_count,
            SessionInfo::Global { total_messages, .. } => *total_messages,
        }
    }
}

/// 会话存储接口
pub trait SessionStore: Send + Sync {
    /// 追加一条带时间戳的消息，并在同一操作内剪枝到最近 N 条
    fn add_message(&self, session_key: &str, role: Role, content: &str) -> Result<(), SessionError>;

    /// 构建有界上下文窗口；无消息或预算排除全部消息时返回空串
    fn get_conversation_context(&self, session_key: &str) -> Result<String, SessionError>;

    /// 删除所有会话中早于 now - ttl 的消息，返回删除行数
    fn cleanup_old_sessions(&self, ttl_hours: u64) -> Result<usize, SessionError>;

    /// 按写入顺序完整导出；没有任何行时返回 None
    fn export_session(&self, session_key: &str) -> Result<Option<Vec<StoredMessage>>, SessionError>;

    /// 删除会话全部消息；返回是否删除了行
    fn delete_session(&self, session_key: &str) -> Result<bool, SessionError>;

    /// Some(key) 为单会话统计，None 为全局统计
    fn get_session_info(&self, session_key: Option<&str>) -> Result<SessionInfo, SessionError>;
}

/// 会话库限制参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_messages_per_session: usize,
    pub max_context_messages: usize,
    pub max_context_chars: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_messages_per_session: 30,
            max_context_messages: 20,
            max_context_chars: 4000,
        }
    }
}

impl From<&SessionSection> for SessionLimits {
    fn from(section: &SessionSection) -> Self {
        Self {
            max_messages_per_session: section.max_messages_per_session.max(1),
            max_context_messages: section.max_context_messages,
            max_context_chars: section.max_context_chars,
        }
    }
}

/// SQLite 会话存储：单连接 + Mutex
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
    limits: SessionLimits,
}

impl SqliteSessionStore {
    /// 打开（或创建）文件库；`:memory:` 打开内存库
    pub fn open(path: impl AsRef<Path>, limits: SessionLimits) -> Result<Self, SessionError> {
        let path = path.as_ref();
        if path.as_os_str() == ":memory:" {
            return Self::in_memory(limits);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        tracing::info!(path = %path.display(), "opened session store");
        Self::with_connection(conn, limits)
    }

    pub fn in_memory(limits: SessionLimits) -> Result<Self, SessionError> {
        Self::with_connection(Connection::open_in_memory()?, limits)
    }

    fn with_connection(conn: Connection, limits: SessionLimits) -> Result<Self, SessionError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            limits: SessionLimits {
                max_messages_per_session: limits.max_messages_per_session.max(1),
                ..limits
            },
        })
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SessionError> {
        self.conn.lock().map_err(|_| SessionError::LockPoisoned)
    }

    /// 以指定时间写入（导入历史或测试 TTL 时使用）
    ///
    /// 顺序仍以写入顺序（id）为准，时间戳只参与 TTL 与统计。
    pub fn add_message_at(
        &self,
        session_key: &str,
        role: Role,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        self.insert_and_prune(session_key, role, content, Some(at))
    }

    /// at 为 None 时在持锁后取当前时间，保证时间戳与提交顺序一致
    fn insert_and_prune(
        &self,
        session_key: &str,
        role: Role,
        content: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), SessionError> {
        if role == Role::System {
            return Err(SessionError::InvalidRole(role));
        }

        let mut conn = self.lock()?;
        let timestamp = format_timestamp(at.unwrap_or_else(Utc::now));
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations (session_key, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![session_key, role.as_str(), content, timestamp],
        )?;
        let pruned = tx.execute(
            "DELETE FROM conversations
             WHERE session_key = ?1
               AND id NOT IN (
                   SELECT id FROM conversations
                   WHERE session_key = ?1
                   ORDER BY id DESC
                   LIMIT ?2
               )",
            params![session_key, self.limits.max_messages_per_session as i64],
        )?;
        tx.commit()?;

        if pruned > 0 {
            tracing::debug!(session_key, pruned, "pruned old messages");
        }
        Ok(())
    }

    /// 删除早于 cutoff 的所有消息
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize, SessionError> {
        // 公元前的截止时间早于任何已存行，且无法按 RFC 3339 格式化
        if cutoff.year() < 1 {
            return Ok(0);
        }
        let cutoff = if cutoff.year() > 9999 {
            "9999-12-31T23:59:59.999999Z".to_string()
        } else {
            format_timestamp(cutoff)
        };

        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM conversations WHERE timestamp <= ?1",
            params![cutoff],
        )?;
        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff, "swept expired messages");
        }
        Ok(deleted)
    }
}

impl SessionStore for SqliteSessionStore {
    fn add_message(&self, session_key: &str, role: Role, content: &str) -> Result<(), SessionError> {
        self.insert_and_prune(session_key, role, content, None)
    }

    fn get_conversation_context(&self, session_key: &str) -> Result<String, SessionError> {
        let rows: Vec<(String, String)> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT role, content FROM conversations
                 WHERE session_key = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(
                    params![session_key, self.limits.max_context_messages as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        Ok(build_context_window(&rows, self.limits.max_context_chars))
    }

    fn cleanup_old_sessions(&self, ttl_hours: u64) -> Result<usize, SessionError> {
        let cutoff = i64::try_from(ttl_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
        match cutoff {
            Some(cutoff) => self.cleanup_before(cutoff),
            None => Ok(0),
        }
    }

    fn export_session(&self, session_key: &str) -> Result<Option<Vec<StoredMessage>>, SessionError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT role, content, timestamp FROM conversations
             WHERE session_key = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![session_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            return Ok(None);
        }

        let messages = rows
            .into_iter()
            .map(|(role, content, timestamp)| {
                let role = role
                    .parse::<Role>()
                    .map_err(|e| SessionError::CorruptRow(format!("session '{session_key}': {e}")))?;
                Ok(StoredMessage {
                    role,
                    content,
                    timestamp,
                })
            })
            .collect::<Result<Vec<_>, SessionError>>()?;
        Ok(Some(messages))
    }

    fn delete_session(&self, session_key: &str) -> Result<bool, SessionError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM conversations WHERE session_key = ?1",
            params![session_key],
        )?;
        tracing::info!(session_key, deleted, "deleted session");
        Ok(deleted > 0)
    }

    fn get_session_info(&self, session_key: Option<&str>) -> Result<SessionInfo, SessionError> {
        let conn = self.lock()?;
        match session_key {
            Some(key) => {
                let (count, first, last): (i64, Option<String>, Option<String>) = conn.query_row(
                    "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM conversations WHERE session_key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
                Ok(SessionInfo::Session {
                    session_key: key.to_string(),
                    message_count: count as usize,
                    first_message_at: first,
                    last_message_at: last,
                })
            }
            None => {
                let row: Option<(i64, i64, Option<String>, Option<String>)> = conn
                    .query_row(
                        "SELECT COUNT(DISTINCT session_key), COUNT(*), MIN(timestamp), MAX(timestamp) FROM conversations",
                        [],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .optional()?;
                let (sessions, messages, oldest, newest) = row.unwrap_or((0, 0, None, None));
                Ok(SessionInfo::Global {
                    total_sessions: sessions as usize,
                    total_messages: messages as usize,
                    oldest_message_at: oldest,
                    newest_message_at: newest,
                })
            }
        }
    }
}

/// 固定宽度的 UTC 时间戳（微秒 + Z），字典序即时间序
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// 从最新到最旧贪心累加，超出 max_chars（含每行格式开销）前停止，再恢复时间顺序并加头尾标记
///
/// rows 须按最新在前排列，元素为 (role, content)。
pub fn build_context_window(rows: &[(String, String)], max_chars: usize) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut used = 0usize;

    for (role, content) in rows {
        let label = role.parse::<Role>().map(|r| r.label()).unwrap_or(role.as_str());
        let line = format!("{label}: {content}\n");
        let cost = line.chars().count();
        if used + cost > max_chars {
            break;
        }
        used += cost;
        lines.push(line);
    }

    if lines.is_empty() {
        return String::new();
    }

    lines.reverse();
    let mut context = String::with_capacity(used + CONTEXT_HEADER.len() + CONTEXT_FOOTER.len());
    context.push_str(CONTEXT_HEADER);
    for line in lines {
        context.push_str(&line);
    }
    context.push_str(CONTEXT_FOOTER);
    context
}
