//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Schema 文档无法编译
    #[error("Schema 错误: {0}")]
    Schema(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 广播通道错误
    #[error("广播通道错误: {0}")]
    Bus(String),

    /// Redis 错误
    #[cfg(feature = "redis")]
    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    /// 后台任务失败（panic 或被取消）
    #[error("后台任务失败: {0}")]
    Join(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Join(e.to_string())
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
