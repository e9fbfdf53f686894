//! 持久化存储
//!
//! 以 UUID 为键的文档存储，两个集合：`agent_identity`、`agent_status`。
//! upsert 采用 `$set` 语义：新文档的顶层字段整体覆盖旧值，旧文档中新文档没有的字段保留。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};

use crate::config::{StoreConfig, StoreMode};
use crate::error::Result;
use crate::schema;
use crate::types::{AgentRecord, Collection};

/// 多进程写同一文件时的锁等待上限
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// 文档存储接口
///
/// 两个写操作都是幂等的；实现必须可在多个线程间共享。
pub trait DocumentStore: Send + Sync {
    /// 不存在则创建，存在则合并顶层字段
    fn upsert(
        &self,
        collection: Collection,
        uuid: &str,
        document: &Map<String, Value>,
    ) -> Result<()>;

    /// 删除文档，返回是否真的删除了
    fn delete(&self, collection: Collection, uuid: &str) -> Result<bool>;

    /// 读取文档
    fn find(&self, collection: Collection, uuid: &str) -> Result<Option<AgentRecord>>;

    /// 集合内文档数
    fn count(&self, collection: Collection) -> Result<usize>;
}

/// SQLite 文档存储
pub struct AgentStore {
    conn: Arc<Mutex<Connection>>,
    config: StoreConfig,
}

impl AgentStore {
    /// 连接存储
    pub fn connect(config: StoreConfig) -> Result<Self> {
        let conn = match config.mode {
            StoreMode::Local => {
                let path = Path::new(&config.url);

                // 确保目录存在
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }

                let conn = Connection::open(path)?;
                // WAL：多个 worker 进程共享同一文件
                let mode: String =
                    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                tracing::debug!("journal_mode={}", mode);
                conn.pragma_update(None, "synchronous", "NORMAL")?;
                conn
            }
            StoreMode::Memory => Connection::open_in_memory()?,
        };

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(schema::SCHEMA_SQL)?;

        tracing::info!("数据库已连接: {}", config.url);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// 当前配置
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// 内存存储 (用于测试和单进程部署)
    pub fn in_memory() -> Result<Self> {
        Self::connect(StoreConfig::in_memory())
    }
}

impl DocumentStore for AgentStore {
    fn upsert(
        &self,
        collection: Collection,
        uuid: &str,
        document: &Map<String, Value>,
    ) -> Result<()> {
        let table = collection.table();
        let mut conn = self.conn.lock();
        // IMMEDIATE：读-合并-写期间持有写锁，其他进程的 upsert 排队
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                &format!("SELECT document FROM {} WHERE uuid = ?1", table),
                params![uuid],
                |row| row.get(0),
            )
            .optional()?;

        let now = current_time_ms();
        match existing {
            Some(raw) => {
                let merged = merge_fields(&raw, document)?;
                tx.execute(
                    &format!("UPDATE {} SET document = ?1, updated_at = ?2 WHERE uuid = ?3", table),
                    params![merged, now, uuid],
                )?;
            }
            None => {
                let json = serde_json::to_string(document)?;
                tx.execute(
                    &format!(
                        "INSERT INTO {} (uuid, document, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?3)",
                        table
                    ),
                    params![uuid, json, now],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn delete(&self, collection: Collection, uuid: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE uuid = ?1", collection.table()),
            params![uuid],
        )?;
        Ok(deleted > 0)
    }

    fn find(&self, collection: Collection, uuid: &str) -> Result<Option<AgentRecord>> {
        let conn = self.conn.lock();
        let row: Option<(String, i64, i64)> = conn
            .query_row(
                &format!(
                    "SELECT document, created_at, updated_at FROM {} WHERE uuid = ?1",
                    collection.table()
                ),
                params![uuid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((document, created_at, updated_at)) => Ok(Some(AgentRecord {
                uuid: uuid.to_string(),
                collection,
                document: serde_json::from_str(&document)?,
                created_at,
                updated_at,
            })),
            None => Ok(None),
        }
    }

    fn count(&self, collection: Collection) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", collection.table()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

/// 把新文档的顶层字段覆盖到旧文档上
fn merge_fields(existing: &str, update: &Map<String, Value>) -> Result<String> {
    let mut merged = match serde_json::from_str::<Value>(existing)? {
        Value::Object(map) => map,
        // 旧数据不是对象时直接以新文档为准
        _ => Map::new(),
    };
    for (key, value) in update {
        merged.insert(key.clone(), value.clone());
    }
    Ok(serde_json::to_string(&merged)?)
}

fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    #[test]
    fn test_merge_fields_keeps_absent_keys() {
        let merged = merge_fields(
            r#"{"a":1,"nested":{"x":1}}"#,
            &doc(json!({"b":2,"nested":{"y":2}})),
        )
        .unwrap();
        let value: Value = serde_json::from_str(&merged).unwrap();

        assert_eq!(value, json!({"a":1,"b":2,"nested":{"y":2}}));
    }

    #[test]
    fn test_merge_fields_non_object_existing() {
        let merged = merge_fields("[1,2]", &doc(json!({"a":1}))).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&merged).unwrap(), json!({"a":1}));
    }

    #[test]
    fn test_upsert_then_find() {
        let store = AgentStore::in_memory().unwrap();
        store
            .upsert(Collection::AgentStatus, "X", &doc(json!({"uuid":"X","state":"idle"})))
            .unwrap();

        let record = store.find(Collection::AgentStatus, "X").unwrap().unwrap();
        assert_eq!(record.document["state"], "idle");
        assert!(store.find(Collection::AgentIdentity, "X").unwrap().is_none());
    }
}
