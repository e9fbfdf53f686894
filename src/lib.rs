//! amr-relay - AMR 互操作消息中继
//!
//! 在 AMR Agent 与监控 UI 之间转发身份和状态消息，转发或持久化之前先按互操作 Schema 校验。
//!
//! # 核心功能
//!
//! - **Schema 校验**: 每条入站消息 → `{ message, isValid, errors }`
//! - **连接注册表**: UI 按连接 ID、Agent 按声明的 UUID 注册
//! - **扇出**: 校验结果经广播通道送达所有 worker 进程的所有 UI
//! - **会话持久化**: 身份 / 状态消息 upsert，Agent 断开时删除
//!
//! # Feature Flags
//!
//! - `redis`: Redis Pub/Sub 广播通道（默认开启）；关闭后只能使用进程内通道

pub mod config;
pub mod db;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod schema;
pub mod types;
pub mod validator;

// Re-exports
pub use config::StoreConfig;
pub use db::{AgentStore, DocumentStore};
pub use error::{Error, Result};
pub use protocol::{Verdict, VerdictError, WS_UI_CHANNEL};
pub use relay::{Relay, RelayConfig, RelayState};
pub use types::*;
pub use validator::SchemaValidator;

/// 完整版本号（语义版本 + 编译时间戳）
///
/// 格式：`{CARGO_PKG_VERSION}-{BUILD_TIMESTAMP}`
pub const VERSION_FULL: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"));
