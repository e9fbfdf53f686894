//! 存储集成测试

use amr_relay::*;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

/// 创建临时数据库
fn setup_store() -> (AgentStore, TempDir) {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("relay.db");
    let store = AgentStore::connect(StoreConfig::local(&db_path)).unwrap();
    (store, tmp)
}

fn doc(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

// ==================== 连接测试 ====================

mod connection_tests {
    use super::*;

    #[test]
    fn test_connect_creates_db_file() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("subdir").join("relay.db");

        // 目录不存在
        assert!(!db_path.parent().unwrap().exists());

        let _store = AgentStore::connect(StoreConfig::local(&db_path)).unwrap();

        // 连接后文件应该存在
        assert!(db_path.exists());
    }

    #[test]
    fn test_connect_existing_db() {
        let (store, tmp) = setup_store();
        store
            .upsert(Collection::AgentStatus, "X", &doc(json!({"uuid": "X"})))
            .unwrap();
        drop(store);

        // 重新连接同一个数据库
        let store = AgentStore::connect(StoreConfig::local(tmp.path().join("relay.db"))).unwrap();
        assert_eq!(store.count(Collection::AgentStatus).unwrap(), 1);
    }

    #[test]
    fn test_two_connections_share_file() {
        // 模拟两个 worker 进程各自持有连接
        let (first, tmp) = setup_store();
        let second = AgentStore::connect(StoreConfig::local(tmp.path().join("relay.db"))).unwrap();

        first
            .upsert(Collection::AgentIdentity, "X", &doc(json!({"uuid": "X", "a": 1})))
            .unwrap();
        second
            .upsert(Collection::AgentIdentity, "X", &doc(json!({"uuid": "X", "b": 2})))
            .unwrap();

        let record = first.find(Collection::AgentIdentity, "X").unwrap().unwrap();
        assert_eq!(record.document, json!({"uuid": "X", "a": 1, "b": 2}));
    }

    #[test]
    fn test_in_memory_config() {
        let config = StoreConfig::in_memory();
        assert!(config.path().is_none());

        let store = AgentStore::connect(config).unwrap();
        assert_eq!(store.count(Collection::AgentIdentity).unwrap(), 0);
    }

    #[test]
    fn test_default_config_from_env() {
        // 不设置环境变量时应该有默认值
        let config = StoreConfig::from_env();
        if std::env::var("RELAY_STORE_URL").is_err() {
            assert!(config.path().unwrap().ends_with("relay.db"));
        }
    }
}

// ==================== Upsert 测试 ====================

mod upsert_tests {
    use super::*;

    #[test]
    fn test_upsert_creates_document() {
        let (store, _tmp) = setup_store();
        store
            .upsert(
                Collection::AgentIdentity,
                "X",
                &doc(json!({"uuid": "X", "type": "AGENT_IDENTITY", "a": 1})),
            )
            .unwrap();

        let record = store.find(Collection::AgentIdentity, "X").unwrap().unwrap();
        assert_eq!(record.uuid, "X");
        assert_eq!(record.collection, Collection::AgentIdentity);
        assert_eq!(record.document["a"], 1);
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn test_upsert_merges_fields() {
        let (store, _tmp) = setup_store();
        store
            .upsert(
                Collection::AgentIdentity,
                "X",
                &doc(json!({"uuid": "X", "type": "AGENT_IDENTITY", "a": 1})),
            )
            .unwrap();
        store
            .upsert(
                Collection::AgentIdentity,
                "X",
                &doc(json!({"uuid": "X", "type": "AGENT_IDENTITY", "b": 2})),
            )
            .unwrap();

        let record = store.find(Collection::AgentIdentity, "X").unwrap().unwrap();
        assert_eq!(record.document["a"], 1);
        assert_eq!(record.document["b"], 2);
        assert_eq!(store.count(Collection::AgentIdentity).unwrap(), 1);
    }

    #[test]
    fn test_upsert_replaces_present_fields() {
        let (store, _tmp) = setup_store();
        store
            .upsert(
                Collection::AgentStatus,
                "X",
                &doc(json!({
                    "uuid": "X",
                    "operationalState": "idle",
                    "location": {"x": 1, "y": 1}
                })),
            )
            .unwrap();
        store
            .upsert(
                Collection::AgentStatus,
                "X",
                &doc(json!({"uuid": "X", "operationalState": "charging", "location": {"x": 2}})),
            )
            .unwrap();

        let record = store.find(Collection::AgentStatus, "X").unwrap().unwrap();
        assert_eq!(record.document["operationalState"], "charging");
        // 顶层字段整体替换，不做深度合并
        assert_eq!(record.document["location"], json!({"x": 2}));
    }

    #[test]
    fn test_collections_are_independent() {
        let (store, _tmp) = setup_store();
        store
            .upsert(Collection::AgentIdentity, "X", &doc(json!({"uuid": "X"})))
            .unwrap();

        assert!(store.find(Collection::AgentStatus, "X").unwrap().is_none());
        assert_eq!(store.count(Collection::AgentStatus).unwrap(), 0);
    }
}

// ==================== Delete 测试 ====================

mod delete_tests {
    use super::*;

    #[test]
    fn test_delete_existing() {
        let (store, _tmp) = setup_store();
        store
            .upsert(Collection::AgentStatus, "X", &doc(json!({"uuid": "X"})))
            .unwrap();
        store
            .upsert(Collection::AgentStatus, "Y", &doc(json!({"uuid": "Y"})))
            .unwrap();

        assert!(store.delete(Collection::AgentStatus, "X").unwrap());
        assert!(store.find(Collection::AgentStatus, "X").unwrap().is_none());
        assert!(store.find(Collection::AgentStatus, "Y").unwrap().is_some());
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let (store, _tmp) = setup_store();

        assert!(!store.delete(Collection::AgentStatus, "missing").unwrap());
        assert!(!store.delete(Collection::AgentIdentity, "missing").unwrap());
    }
}
