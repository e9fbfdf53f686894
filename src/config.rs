//! 存储配置

use std::path::PathBuf;

/// 内存数据库标记
pub const IN_MEMORY: &str = ":memory:";

/// 存储连接配置
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// 连接 URL
    /// - 本地: "/path/to/relay.db"
    /// - 内存: ":memory:"（单进程部署 / 测试）
    pub url: String,

    /// 连接模式
    pub mode: StoreMode,
}

/// 连接模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// 本地 SQLite 文件（多个 worker 进程可共享）
    Local,
    /// 进程内存，进程退出即丢失
    Memory,
}

impl StoreConfig {
    /// 创建本地 SQLite 配置
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        Self {
            url: path.display().to_string(),
            mode: StoreMode::Local,
        }
    }

    /// 创建内存数据库配置
    pub fn in_memory() -> Self {
        Self {
            url: IN_MEMORY.to_string(),
            mode: StoreMode::Memory,
        }
    }

    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        if let Ok(url) = std::env::var("RELAY_STORE_URL") {
            if url == IN_MEMORY {
                return Self::in_memory();
            }
            return Self::local(url);
        }

        // 默认路径: ~/.amr-relay/db/relay.db
        let default_path = dirs::home_dir()
            .map(|h| h.join(".amr-relay").join("db").join("relay.db"))
            .unwrap_or_else(|| PathBuf::from("relay.db"));

        Self::local(default_path)
    }

    /// 获取数据库文件路径 (仅本地模式)
    pub fn path(&self) -> Option<PathBuf> {
        match self.mode {
            StoreMode::Local => Some(PathBuf::from(&self.url)),
            StoreMode::Memory => None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
