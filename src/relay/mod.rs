//! Relay 模块 - 校验 + 扇出 + 会话持久化
//!
//! - 接收 Agent / UI 的 WebSocket 消息并按 Schema 校验
//! - 通过广播通道把校验结果推送给所有进程的所有 UI
//! - 跟随 Agent 连接生命周期写入 / 删除持久化文档

pub mod broker;
pub mod bus;
pub mod persistence;
pub mod registry;
pub mod server;
pub mod session;

pub use broker::FanoutBroker;
pub use bus::{BroadcastBus, LocalBus};
#[cfg(feature = "redis")]
pub use bus::RedisBus;
pub use persistence::{PersistCommand, PersistenceGateway, SessionWriter};
pub use registry::{
    AgentRegistry, ConnId, Connection, ConnectionRegistry, MessageSender, UiRegistry,
};
pub use server::{build_router, Relay, RelayConfig, RelayState};
pub use session::{AgentPhase, AgentSession, UiSession};
