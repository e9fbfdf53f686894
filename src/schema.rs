//! 数据库 Schema 定义

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- Agent 身份表（AGENT_IDENTITY）
CREATE TABLE IF NOT EXISTS agent_identity (
    uuid TEXT PRIMARY KEY,
    document TEXT NOT NULL,   -- 合并后的 JSON 文档
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

-- Agent 状态表（AGENT_STATUS）
CREATE TABLE IF NOT EXISTS agent_status (
    uuid TEXT PRIMARY KEY,
    document TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

CREATE INDEX IF NOT EXISTS idx_agent_status_updated ON agent_status(updated_at DESC);
"#;
