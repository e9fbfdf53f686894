//! 持久化类型定义

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 持久化集合
///
/// 每个 Agent UUID 在每个集合中最多一条文档。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// 静态身份信息（AGENT_IDENTITY）
    AgentIdentity,
    /// 动态状态快照（AGENT_STATUS）
    AgentStatus,
}

impl Collection {
    /// Agent 断开时需要清理的全部集合
    pub const ALL: [Collection; 2] = [Collection::AgentIdentity, Collection::AgentStatus];

    /// 表名
    pub fn table(&self) -> &'static str {
        match self {
            Collection::AgentIdentity => "agent_identity",
            Collection::AgentStatus => "agent_status",
        }
    }

    /// 根据消息的 `type` 字段选择集合，未知类型不触发持久化
    pub fn for_message_type(message_type: &str) -> Option<Self> {
        match message_type {
            crate::protocol::message_type::AGENT_IDENTITY => Some(Collection::AgentIdentity),
            crate::protocol::message_type::AGENT_STATUS => Some(Collection::AgentStatus),
            _ => None,
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// 已持久化的 Agent 文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub uuid: String,
    pub collection: Collection,
    /// 合并后的完整文档
    pub document: Value,
    /// 毫秒时间戳
    pub created_at: i64,
    /// 毫秒时间戳
    pub updated_at: i64,
}
