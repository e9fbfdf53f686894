//! 连接注册表
//!
//! 会话标识 → 出站通道。UI 注册表以进程内连接 ID 为键，Agent 注册表以 Agent 声明的 UUID 为键。
//! 条目之间相互独立，每次 insert/remove/lookup 各自原子即可。

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::RwLock;
use tokio::sync::mpsc;

/// 连接 ID（进程内唯一）
pub type ConnId = u64;

/// 消息发送通道
pub type MessageSender = mpsc::Sender<String>;

/// 已注册的连接
#[derive(Debug, Clone)]
pub struct Connection {
    /// 所属会话
    pub conn_id: ConnId,
    /// 出站通道，由连接的写任务消费
    pub sender: MessageSender,
}

impl Connection {
    pub fn new(conn_id: ConnId, sender: MessageSender) -> Self {
        Self { conn_id, sender }
    }

    /// 传输是否仍然打开
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// 连接注册表
pub struct ConnectionRegistry<K> {
    connections: RwLock<HashMap<K, Connection>>,
}

/// UI 注册表（匿名观察者）
pub type UiRegistry = ConnectionRegistry<ConnId>;

/// Agent 注册表（UUID → 最后一次连接的传输）
pub type AgentRegistry = ConnectionRegistry<String>;

impl<K> ConnectionRegistry<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// 注册连接，返回被覆盖的旧连接（最后连接者获胜）
    pub fn register(&self, key: K, connection: Connection) -> Option<Connection> {
        let previous = self.connections.write().insert(key.clone(), connection);
        tracing::debug!("📡 Connection registered: key={:?}", key);
        previous
    }

    /// 注销连接；不存在时为空操作
    pub fn unregister(&self, key: &K) -> Option<Connection> {
        let removed = self.connections.write().remove(key);
        if removed.is_some() {
            tracing::debug!("📡 Connection unregistered: key={:?}", key);
        }
        removed
    }

    /// 仅当条目仍属于 `conn_id` 时注销
    ///
    /// 同一 UUID 被新连接接管后，旧连接的关闭不能把新连接移出注册表。
    pub fn unregister_owned(&self, key: &K, conn_id: ConnId) -> bool {
        let mut connections = self.connections.write();
        match connections.get(key) {
            Some(conn) if conn.conn_id == conn_id => {
                connections.remove(key);
                tracing::debug!("📡 Connection unregistered: key={:?}, conn_id={}", key, conn_id);
                true
            }
            Some(_) => {
                tracing::debug!(
                    "📡 Registration for {:?} owned by another connection, keeping it",
                    key
                );
                false
            }
            None => false,
        }
    }

    /// 查找连接
    pub fn get(&self, key: &K) -> Option<Connection> {
        self.connections.read().get(key).cloned()
    }

    /// 时间点快照，广播时遍历它而不是持锁遍历
    pub fn snapshot(&self) -> Vec<(K, Connection)> {
        self.connections
            .read()
            .iter()
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect()
    }

    /// 获取当前连接数
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// 检查是否为空
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

impl<K> Default for ConnectionRegistry<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
