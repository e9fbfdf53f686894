//! 传输协议定义
//!
//! 入站：每个 WebSocket 文本帧是一条独立的 JSON 文档。
//! 出站：校验结果信封 `{ message, isValid, errors }`，同时也是广播通道上的载荷。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 默认广播通道名
pub const WS_UI_CHANNEL: &str = "ws:UIChannel";

/// 已知的消息类型常量（`type` 字段）
pub mod message_type {
    pub const AGENT_IDENTITY: &str = "AGENT_IDENTITY";
    pub const AGENT_STATUS: &str = "AGENT_STATUS";
}

/// 单条入站消息的校验结果
///
/// 不变量：`is_valid == errors.is_empty()`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    /// 解析后的 JSON；解析失败时为原始文本
    pub message: Value,
    pub is_valid: bool,
    pub errors: Vec<VerdictError>,
}

/// 校验失败项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VerdictError {
    /// 输入不是合法 JSON
    #[serde(rename = "MalformedJSON")]
    MalformedJson {
        /// 解析器诊断信息
        message: String,
    },

    /// 违反 Schema 约束（每条约束一项）
    SchemaViolation {
        /// 可读的错误描述
        message: String,
        /// 出错字段的 JSON Pointer（根为空串）
        #[serde(rename = "instancePath")]
        instance_path: String,
        /// 被违反规则在 Schema 中的位置
        #[serde(rename = "schemaPath")]
        schema_path: String,
        /// 被违反的关键字，如 `required`、`format`
        keyword: String,
    },
}

impl Verdict {
    /// 通过校验
    pub fn valid(message: Value) -> Self {
        Self {
            message,
            is_valid: true,
            errors: Vec::new(),
        }
    }

    /// 未通过校验；`errors` 不应为空
    pub fn invalid(message: Value, errors: Vec<VerdictError>) -> Self {
        debug_assert!(!errors.is_empty());
        Self {
            message,
            is_valid: false,
            errors,
        }
    }

    /// 消息声明的 Agent UUID
    pub fn uuid(&self) -> Option<&str> {
        self.message.get("uuid").and_then(Value::as_str)
    }

    /// 消息的 `type` 判别字段
    pub fn message_type(&self) -> Option<&str> {
        self.message.get("type").and_then(Value::as_str)
    }

    /// 序列化为出站 JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
