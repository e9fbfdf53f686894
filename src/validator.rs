//! Schema 校验器
//!
//! 原始字节 → [`Verdict`]。先做 JSON 解析，解析失败直接短路为 `MalformedJSON`；
//! 解析成功后对照预编译的 Schema 校验（启用 format 校验：uuid、date-time 等）。
//!
//! 编译后的 Schema 只读，可在多个会话任务间共享。

use std::path::Path;

use jsonschema::Validator;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::{Verdict, VerdictError};

/// 内置的互操作 Schema
pub const EMBEDDED_SCHEMA: &str = include_str!("../schema/schema.json");

/// 内置的示例消息（`GET /test-message`）
pub const EMBEDDED_TEST_MESSAGE: &str = include_str!("../schema/test-message.json");

/// Schema 校验器
pub struct SchemaValidator {
    validator: Validator,
}

impl SchemaValidator {
    /// 从 Schema 文档编译
    pub fn new(schema: &Value) -> Result<Self> {
        let validator = jsonschema::options()
            .should_validate_formats(true)
            .build(schema)
            .map_err(|e| Error::Schema(e.to_string()))?;
        Ok(Self { validator })
    }

    /// 使用内置 Schema
    pub fn embedded() -> Result<Self> {
        let schema: Value = serde_json::from_str(EMBEDDED_SCHEMA)?;
        Self::new(&schema)
    }

    /// 从文件加载 Schema
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let schema: Value = serde_json::from_str(&content)?;
        tracing::info!("📐 加载 Schema: {:?}", path);
        Self::new(&schema)
    }

    /// 校验一条入站消息
    pub fn validate(&self, payload: &[u8]) -> Verdict {
        let message: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Not valid JSON: {}", e);
                let raw = String::from_utf8_lossy(payload).into_owned();
                return Verdict::invalid(
                    Value::String(raw),
                    vec![VerdictError::MalformedJson {
                        message: e.to_string(),
                    }],
                );
            }
        };

        let errors: Vec<VerdictError> = self
            .validator
            .iter_errors(&message)
            .map(|e| {
                let schema_path = e.schema_path.to_string();
                let keyword = schema_path
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                VerdictError::SchemaViolation {
                    message: e.to_string(),
                    instance_path: e.instance_path.to_string(),
                    schema_path,
                    keyword,
                }
            })
            .collect();

        if errors.is_empty() {
            Verdict::valid(message)
        } else {
            Verdict::invalid(message, errors)
        }
    }
}

/// 内置示例消息
pub fn test_message() -> Result<Value> {
    Ok(serde_json::from_str(EMBEDDED_TEST_MESSAGE)?)
}
