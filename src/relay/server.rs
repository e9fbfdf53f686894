//! Relay 服务器
//!
//! axum WebSocket 服务：
//! - `/`：Agent 连接
//! - `/ui`：UI 连接
//! - `GET /test-message`：返回一条符合 Schema 的示例消息

use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::broker::FanoutBroker;
use super::bus::{self, BroadcastBus};
use super::persistence::PersistenceGateway;
use super::registry::{AgentRegistry, ConnId, MessageSender, UiRegistry};
use super::session::{AgentSession, UiSession};
use crate::config::StoreConfig;
use crate::db::{AgentStore, DocumentStore};
use crate::error::{Error, Result};
use crate::protocol::WS_UI_CHANNEL;
use crate::validator::{self, SchemaValidator};

/// Relay 配置
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口（0 表示随机端口）
    pub port: u16,
    /// 广播通道：`redis://...` 或 `local`
    pub bus_url: String,
    /// 广播主题
    pub channel: String,
    /// 自定义 Schema 路径，缺省使用内置 Schema
    pub schema_path: Option<PathBuf>,
    /// 持久化存储
    pub store: StoreConfig,
    /// 每个连接的出站队列容量
    pub send_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            bus_url: "redis://localhost:6379".to_string(),
            channel: WS_UI_CHANNEL.to_string(),
            schema_path: None,
            store: StoreConfig::default(),
            send_queue: 256,
        }
    }
}

impl RelayConfig {
    /// 从环境变量创建配置，未设置的项使用默认值
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("RELAY_HOST") {
            config.host = host;
        }
        let port = match env_parse::<u16>("RELAY_PORT")? {
            Some(port) => Some(port),
            None => env_parse::<u16>("PORT")?,
        };
        if let Some(port) = port {
            config.port = port;
        }
        if let Ok(url) = std::env::var("RELAY_BUS_URL") {
            config.bus_url = url;
        }
        if let Ok(channel) = std::env::var("RELAY_CHANNEL") {
            config.channel = channel;
        }
        if let Ok(path) = std::env::var("RELAY_SCHEMA_PATH") {
            config.schema_path = Some(PathBuf::from(path));
        }
        if let Some(queue) = env_parse::<usize>("RELAY_SEND_QUEUE")? {
            if queue == 0 {
                return Err(Error::Config("RELAY_SEND_QUEUE 必须大于 0".into()));
            }
            config.send_queue = queue;
        }

        Ok(config)
    }

    /// 监听地址
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} 无法解析: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// 会话处理器共享的进程级状态
#[derive(Clone)]
pub struct RelayState {
    pub validator: Arc<SchemaValidator>,
    pub broker: Arc<FanoutBroker>,
    pub ui: Arc<UiRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub persistence: Arc<PersistenceGateway>,
    pub test_message: Arc<Value>,
    pub send_queue: usize,
    next_conn_id: Arc<AtomicU64>,
}

impl RelayState {
    /// 建立进程级状态；广播订阅在这里建立且只建立一次
    pub async fn new(
        validator: SchemaValidator,
        bus: Arc<dyn BroadcastBus>,
        channel: &str,
        store: Arc<dyn DocumentStore>,
        test_message: Value,
        send_queue: usize,
    ) -> Result<Self> {
        let ui = Arc::new(UiRegistry::new());
        let broker = FanoutBroker::start(bus, channel, ui.clone()).await?;

        Ok(Self {
            validator: Arc::new(validator),
            broker,
            ui,
            agents: Arc::new(AgentRegistry::new()),
            persistence: Arc::new(PersistenceGateway::new(store)),
            test_message: Arc::new(test_message),
            send_queue,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// 分配连接 ID
    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Relay 服务
pub struct Relay {
    config: RelayConfig,
    state: RelayState,
}

impl Relay {
    /// 按配置创建：编译 Schema、连接广播通道和存储，任何一步失败都是启动错误
    pub async fn new(config: RelayConfig) -> Result<Self> {
        let validator = match &config.schema_path {
            Some(path) => SchemaValidator::from_path(path)?,
            None => SchemaValidator::embedded()?,
        };
        let bus = bus::connect(&config.bus_url).await?;
        let store = Arc::new(AgentStore::connect(config.store.clone())?);

        Self::with_components(config, validator, bus, store).await
    }

    /// 使用外部提供的组件创建（测试、嵌入）
    pub async fn with_components(
        config: RelayConfig,
        validator: SchemaValidator,
        bus: Arc<dyn BroadcastBus>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self> {
        let test_message = validator::test_message()?;
        let state = RelayState::new(
            validator,
            bus,
            &config.channel,
            store,
            test_message,
            config.send_queue,
        )
        .await?;

        Ok(Self { config, state })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// 路由
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// 绑定配置的地址并运行，直到收到 Ctrl-C
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        tracing::info!(
            "🚀 AMR relay listening on {} (channel={})",
            listener.local_addr()?,
            self.config.channel
        );
        self.serve(listener, shutdown_signal()).await
    }

    /// 在给定的监听器上运行，直到 `shutdown` 完成
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!(
            "🧹 Relay stopped: ui={}, agents={}",
            self.state.ui.len(),
            self.state.agents.len()
        );
        Ok(())
    }
}

/// 构建路由
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(agent_ws_handler))
        .route("/ui", get(ui_ws_handler))
        .route("/test-message", get(test_message_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听中断信号失败: {}", e);
        return;
    }
    tracing::info!("收到中断信号，准备退出...");
}

async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn ui_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, state))
}

async fn test_message_handler(State(state): State<RelayState>) -> Json<Value> {
    Json(state.test_message.as_ref().clone())
}

/// 处理单个 Agent 连接
async fn handle_agent_socket(socket: WebSocket, state: RelayState) {
    let (mut stream, sender, write_handle) = spawn_writer(socket, state.send_queue);
    let mut session = AgentSession::open(state, sender);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(message) => {
                if let Some(payload) = payload_of(&message) {
                    session.on_message(payload).await;
                }
            }
            Err(e) => {
                tracing::warn!("读取失败: conn_id={}, {}", session.conn_id(), e);
                break;
            }
        }
    }

    // 删除在后台按顺序执行，这里不等待
    drop(session.close());
    write_handle.abort();
}

/// 处理单个 UI 连接
async fn handle_ui_socket(socket: WebSocket, state: RelayState) {
    let (mut stream, sender, write_handle) = spawn_writer(socket, state.send_queue);
    let session = UiSession::open(state, sender);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(message) => {
                if let Some(payload) = payload_of(&message) {
                    session.on_message(payload).await;
                }
            }
            Err(e) => {
                tracing::warn!("读取失败: conn_id={}, {}", session.conn_id(), e);
                break;
            }
        }
    }

    session.close();
    write_handle.abort();
}

/// 拆分连接，启动发送任务；返回读端和出站通道
fn spawn_writer(
    socket: WebSocket,
    queue: usize,
) -> (SplitStream<WebSocket>, MessageSender, JoinHandle<()>) {
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(queue);

    let handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(msg.into())).await {
                tracing::debug!("WebSocket send failed, client disconnected: {}", e);
                break;
            }
        }
    });

    (stream, tx, handle)
}

/// 数据帧的载荷；控制帧返回 None
fn payload_of(message: &Message) -> Option<&[u8]> {
    match message {
        Message::Text(text) => Some(text.as_str().as_bytes()),
        Message::Binary(data) => Some(data.as_ref()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::bus::LocalBus;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();

        assert_eq!(config.port, 8080);
        assert_eq!(config.channel, "ws:UIChannel");
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert!(config.schema_path.is_none());
    }

    #[test]
    fn test_payload_of_control_frames() {
        assert!(payload_of(&Message::Ping(Default::default())).is_none());
        assert_eq!(
            payload_of(&Message::Text(String::from("{}").into())),
            Some("{}".as_bytes())
        );
    }

    #[tokio::test]
    async fn test_test_message_handler_returns_valid_message() {
        let relay = Relay::with_components(
            RelayConfig::default(),
            SchemaValidator::embedded().unwrap(),
            Arc::new(LocalBus::new()),
            Arc::new(AgentStore::in_memory().unwrap()),
        )
        .await
        .unwrap();

        let Json(body) = test_message_handler(State(relay.state().clone())).await;
        let verdict = relay
            .state()
            .validator
            .validate(&serde_json::to_vec(&body).unwrap());
        assert!(verdict.is_valid, "errors: {:?}", verdict.errors);
    }

    #[tokio::test]
    async fn test_conn_ids_are_distinct() {
        let relay = Relay::with_components(
            RelayConfig::default(),
            SchemaValidator::embedded().unwrap(),
            Arc::new(LocalBus::new()),
            Arc::new(AgentStore::in_memory().unwrap()),
        )
        .await
        .unwrap();

        let a = relay.state().next_conn_id();
        let b = relay.state().next_conn_id();
        assert_ne!(a, b);
    }
}
