//! 持久化网关
//!
//! 包装 [`DocumentStore`]：存储调用放到阻塞线程池执行，失败只记录日志，
//! 不会让会话任务崩溃或阻塞消息转发。
//!
//! 每个 Agent 会话持有一个 [`SessionWriter`]，按接收顺序串行执行本会话的写操作，
//! 断开时的删除排在所有未完成的 upsert 之后。

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::db::DocumentStore;
use crate::error::Result;
use crate::types::Collection;

/// 持久化命令
#[derive(Debug, Clone)]
pub enum PersistCommand {
    /// 合并写入一条文档
    Upsert {
        collection: Collection,
        uuid: String,
        document: Map<String, Value>,
    },
    /// 删除该 UUID 的全部文档
    Delete { uuid: String },
}

/// 持久化网关
pub struct PersistenceGateway {
    store: Arc<dyn DocumentStore>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// 底层存储
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// 合并写入
    pub async fn upsert(
        &self,
        collection: Collection,
        uuid: &str,
        document: Map<String, Value>,
    ) -> Result<()> {
        let store = self.store.clone();
        let uuid = uuid.to_string();
        tokio::task::spawn_blocking(move || store.upsert(collection, &uuid, &document)).await?
    }

    /// 删除 Agent 的身份和状态文档，返回实际删除的条数
    pub async fn delete_agent(&self, uuid: &str) -> Result<usize> {
        let store = self.store.clone();
        let uuid = uuid.to_string();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut deleted = 0;
            for collection in Collection::ALL {
                if store.delete(collection, &uuid)? {
                    deleted += 1;
                }
            }
            Ok(deleted)
        })
        .await?
    }

    /// 执行一条命令，失败只记录日志
    pub async fn execute(&self, command: PersistCommand) {
        match command {
            PersistCommand::Upsert {
                collection,
                uuid,
                document,
            } => {
                match self.upsert(collection, &uuid, document).await {
                    Ok(()) => tracing::debug!("💾 Upserted {}: uuid={}", collection, uuid),
                    Err(e) => {
                        tracing::error!("Failed to upsert {} for {}: {}", collection, uuid, e)
                    }
                }
            }
            PersistCommand::Delete { uuid } => match self.delete_agent(&uuid).await {
                Ok(n) => tracing::info!("🗑️ Deleted agent records: uuid={}, documents={}", uuid, n),
                Err(e) => tracing::error!("Failed to delete records for {}: {}", uuid, e),
            },
        }
    }

    /// 为一个会话创建有序写队列
    pub fn session_writer(self: &Arc<Self>) -> SessionWriter {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistCommand>();
        let gateway = self.clone();

        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                gateway.execute(command).await;
            }
        });

        SessionWriter { tx, handle }
    }
}

/// 单会话的有序写队列
pub struct SessionWriter {
    tx: mpsc::UnboundedSender<PersistCommand>,
    handle: JoinHandle<()>,
}

impl SessionWriter {
    /// 入队，不等待执行
    pub fn submit(&self, command: PersistCommand) {
        if self.tx.send(command).is_err() {
            tracing::error!("Persistence queue closed, dropping command");
        }
    }

    /// 关闭队列；返回的句柄在队列中所有命令执行完后结束
    pub fn finish(self) -> JoinHandle<()> {
        drop(self.tx);
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AgentStore;
    use crate::error::Error;
    use crate::types::AgentRecord;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    /// 所有操作都失败的存储
    struct BrokenStore;

    impl DocumentStore for BrokenStore {
        fn upsert(&self, _: Collection, _: &str, _: &Map<String, Value>) -> Result<()> {
            Err(Error::Config("store offline".into()))
        }
        fn delete(&self, _: Collection, _: &str) -> Result<bool> {
            Err(Error::Config("store offline".into()))
        }
        fn find(&self, _: Collection, _: &str) -> Result<Option<AgentRecord>> {
            Ok(None)
        }
        fn count(&self, _: Collection) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_delete_agent_removes_both_collections() {
        let gateway = PersistenceGateway::new(Arc::new(AgentStore::in_memory().unwrap()));
        gateway
            .upsert(Collection::AgentIdentity, "X", doc(json!({"uuid": "X"})))
            .await
            .unwrap();
        gateway
            .upsert(Collection::AgentStatus, "X", doc(json!({"uuid": "X"})))
            .await
            .unwrap();

        assert_eq!(gateway.delete_agent("X").await.unwrap(), 2);
        assert_eq!(gateway.delete_agent("X").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_session_writer_runs_delete_last() {
        let gateway = Arc::new(PersistenceGateway::new(Arc::new(AgentStore::in_memory().unwrap())));
        let writer = gateway.session_writer();

        for i in 0..20 {
            writer.submit(PersistCommand::Upsert {
                collection: Collection::AgentStatus,
                uuid: "X".to_string(),
                document: doc(json!({"uuid": "X", "seq": i})),
            });
        }
        writer.submit(PersistCommand::Delete {
            uuid: "X".to_string(),
        });
        writer.finish().await.unwrap();

        assert!(gateway.store().find(Collection::AgentStatus, "X").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failures_are_contained() {
        let gateway = Arc::new(PersistenceGateway::new(Arc::new(BrokenStore)));
        assert!(gateway
            .upsert(Collection::AgentStatus, "X", doc(json!({"uuid": "X"})))
            .await
            .is_err());

        // 队列在失败后继续工作
        let writer = gateway.session_writer();
        writer.submit(PersistCommand::Delete {
            uuid: "X".to_string(),
        });
        writer.submit(PersistCommand::Delete {
            uuid: "Y".to_string(),
        });
        assert!(writer.finish().await.is_ok());
    }
}
