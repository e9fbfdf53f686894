//! 会话生命周期
//!
//! UI 会话：接入 → 每条消息校验并发布 → 关闭时注销。
//!
//! Agent 会话状态机：
//! - `Unidentified`：已接入，UUID 未知，未进入 Agent 注册表
//! - `Identified`：首条带 UUID 且通过校验的消息到达后进入，按 UUID 注册（最后连接者获胜）
//! - 关闭（终态）：由 [`AgentSession::close`] 消费会话；已识别时注销并删除该 UUID 的持久化文档
//!
//! 每条 Agent 消息：校验 → 发布（无论是否通过）→ 未通过则点对点回显错误 →
//! 通过则注册 UUID，并按 `type` 分发到持久化。

use tokio::task::JoinHandle;

use super::persistence::{PersistCommand, SessionWriter};
use super::registry::{ConnId, Connection, MessageSender};
use super::server::RelayState;
use crate::protocol::Verdict;
use crate::types::Collection;

/// Agent 会话阶段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentPhase {
    Unidentified,
    Identified { uuid: String },
}

/// UI 会话（匿名观察者）
pub struct UiSession {
    conn_id: ConnId,
    state: RelayState,
}

impl UiSession {
    /// 接入并注册到 UI 注册表
    pub fn open(state: RelayState, sender: MessageSender) -> Self {
        let conn_id = state.next_conn_id();
        state.ui.register(conn_id, Connection::new(conn_id, sender));
        tracing::info!("🖥️ UI has connected: conn_id={}", conn_id);
        Self { conn_id, state }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// 校验并发布；回显通过广播到达（包括发送者自己）
    pub async fn on_message(&self, payload: &[u8]) -> Verdict {
        tracing::debug!("Received a test message from UI: conn_id={}", self.conn_id);
        let verdict = self.state.validator.validate(payload);
        publish(&self.state, &verdict).await;
        verdict
    }

    /// 关闭：只注销，不涉及持久化
    pub fn close(self) {
        self.state.ui.unregister(&self.conn_id);
        tracing::info!("🖥️ UI websocket has closed: conn_id={}", self.conn_id);
    }
}

/// Agent 会话
pub struct AgentSession {
    conn_id: ConnId,
    phase: AgentPhase,
    sender: MessageSender,
    state: RelayState,
    writer: SessionWriter,
}

impl AgentSession {
    /// 接入；此时 UUID 未知，不注册
    pub fn open(state: RelayState, sender: MessageSender) -> Self {
        let conn_id = state.next_conn_id();
        let writer = state.persistence.session_writer();
        tracing::info!("🤖 Agent has connected: conn_id={}", conn_id);
        Self {
            conn_id,
            phase: AgentPhase::Unidentified,
            sender,
            state,
            writer,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn phase(&self) -> &AgentPhase {
        &self.phase
    }

    /// 已识别的 UUID
    pub fn uuid(&self) -> Option<&str> {
        match &self.phase {
            AgentPhase::Identified { uuid } => Some(uuid),
            AgentPhase::Unidentified => None,
        }
    }

    /// 处理一条入站消息
    pub async fn on_message(&mut self, payload: &[u8]) -> Verdict {
        tracing::debug!("Received a message from the agent: conn_id={}", self.conn_id);
        let verdict = self.state.validator.validate(payload);
        publish(&self.state, &verdict).await;

        if !verdict.is_valid {
            self.echo(&verdict).await;
            return verdict;
        }

        if let Some(uuid) = verdict.uuid() {
            self.identify(uuid);
        }
        self.dispatch(&verdict);

        verdict
    }

    /// 关闭会话
    ///
    /// 删除命令排在本会话所有未完成的写操作之后；返回的句柄在队列清空后结束，调用方不必等待。
    pub fn close(self) -> JoinHandle<()> {
        let AgentSession {
            conn_id,
            phase,
            state,
            writer,
            ..
        } = self;

        match phase {
            AgentPhase::Identified { uuid } => {
                tracing::info!("🤖 Agent websocket has closed: uuid={}, conn_id={}", uuid, conn_id);
                state.agents.unregister_owned(&uuid, conn_id);
                writer.submit(PersistCommand::Delete { uuid });
            }
            AgentPhase::Unidentified => {
                tracing::info!("🤖 Unidentified agent websocket has closed: conn_id={}", conn_id);
            }
        }

        writer.finish()
    }

    /// 点对点回显校验错误
    async fn echo(&self, verdict: &Verdict) {
        let json = match verdict.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize verdict: {}", e);
                return;
            }
        };
        if self.sender.send(json).await.is_err() {
            tracing::warn!("Failed to echo verdict, transport closed: conn_id={}", self.conn_id);
        }
    }

    /// 按 UUID 注册；同一 UUID 重复出现时不重复注册
    fn identify(&mut self, uuid: &str) {
        if let AgentPhase::Identified { uuid: current } = &self.phase {
            if current == uuid {
                return;
            }
            tracing::warn!(
                "🤖 Agent changed uuid: {} -> {}, conn_id={}",
                current,
                uuid,
                self.conn_id
            );
            self.state.agents.unregister_owned(current, self.conn_id);
        }

        let replaced = self.state.agents.register(
            uuid.to_string(),
            Connection::new(self.conn_id, self.sender.clone()),
        );
        if let Some(previous) = replaced {
            tracing::info!(
                "🤖 Agent {} reconnected, replacing conn_id={}",
                uuid,
                previous.conn_id
            );
        }
        tracing::info!("🤖 Agent identified: uuid={}, conn_id={}", uuid, self.conn_id);
        self.phase = AgentPhase::Identified {
            uuid: uuid.to_string(),
        };
    }

    /// 按 `type` 分发到持久化；未知类型不写入
    fn dispatch(&self, verdict: &Verdict) {
        let Some(collection) = verdict.message_type().and_then(Collection::for_message_type) else {
            tracing::trace!("No persistence for message type {:?}", verdict.message_type());
            return;
        };

        let (Some(uuid), Some(document)) = (verdict.uuid(), verdict.message.as_object()) else {
            tracing::warn!("{} message without uuid, not persisted", collection);
            return;
        };

        self.writer.submit(PersistCommand::Upsert {
            collection,
            uuid: uuid.to_string(),
            document: document.clone(),
        });
    }
}

/// 发布到广播通道；失败只记录日志
async fn publish(state: &RelayState, verdict: &Verdict) {
    if let Err(e) = state.broker.publish(verdict).await {
        tracing::error!("Failed to publish verdict: {}", e);
    }
}
