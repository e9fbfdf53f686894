//! 广播通道
//!
//! 进程外发布/订阅通道的抽象。同一服务的所有 worker 进程订阅同一个主题，
//! 任何进程发布的消息都会被每个订阅进程收到一次。订阅断开期间发布的消息直接丢失，不排队。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;

/// 订阅端缓冲
const SUBSCRIPTION_BUFFER: usize = 1024;

/// 发布/订阅通道
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    /// 发布一条载荷
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// 订阅主题，返回载荷流；通道断开时流结束
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}

/// 进程内广播通道
///
/// 单进程部署和测试使用；克隆出来的实例共享同一条通道，可以模拟多个进程。
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<(String, String)>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIPTION_BUFFER);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastBus for LocalBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        // 没有订阅者时 send 返回错误，与 Redis PUBLISH 返回 0 等价
        if self.tx.send((channel.to_string(), payload)).is_err() {
            tracing::trace!("📡 No subscribers on {}", channel);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut rx = self.tx.subscribe();
        let (tx, out) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((topic, payload)) => {
                        if topic != channel {
                            continue;
                        }
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("📡 Subscriber lagging, dropped {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(out)
    }
}

/// Redis 重连退避区间
#[cfg(feature = "redis")]
const RECONNECT_MIN: std::time::Duration = std::time::Duration::from_millis(100);
#[cfg(feature = "redis")]
const RECONNECT_MAX: std::time::Duration = std::time::Duration::from_secs(5);

/// Redis Pub/Sub 通道
///
/// 发布走 `ConnectionManager`，断线后下一次发布自动重连；
/// 订阅连接断开后由转发任务按退避重连并重新订阅，断开期间的消息丢失。
#[cfg(feature = "redis")]
pub struct RedisBus {
    client: redis::Client,
    publisher: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis")]
impl RedisBus {
    /// 连接 Redis；启动时不可达视为致命错误
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_connection_manager().await?;
        tracing::info!("🔌 Redis 已连接: {}", url);
        Ok(Self { client, publisher })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl BroadcastBus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        use redis::AsyncCommands;

        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        tracing::trace!("📡 Published to {}: receivers={}", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let pubsub = open_pubsub(&self.client, channel).await?;
        tracing::info!("📡 Subscribed to {}", channel);

        let (tx, out) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let client = self.client.clone();
        let channel = channel.to_string();

        tokio::spawn(async move {
            let mut pubsub = pubsub;
            loop {
                if !forward_messages(pubsub, &channel, &tx).await {
                    return;
                }
                tracing::warn!("📡 Redis subscription to {} lost, reconnecting", channel);

                let mut backoff = RECONNECT_MIN;
                pubsub = loop {
                    if tx.is_closed() {
                        return;
                    }
                    tokio::time::sleep(backoff).await;
                    match open_pubsub(&client, &channel).await {
                        Ok(pubsub) => break pubsub,
                        Err(e) => {
                            backoff = (backoff * 2).min(RECONNECT_MAX);
                            tracing::warn!(
                                "📡 Redis resubscribe to {} failed, retry in {:?}: {}",
                                channel,
                                backoff,
                                e
                            );
                        }
                    }
                };
                tracing::info!("📡 Resubscribed to {}", channel);
            }
        });

        Ok(out)
    }
}

#[cfg(feature = "redis")]
async fn open_pubsub(client: &redis::Client, channel: &str) -> Result<redis::aio::PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

/// 转发直到订阅连接断开；接收端已关闭时返回 false
#[cfg(feature = "redis")]
async fn forward_messages(
    pubsub: redis::aio::PubSub,
    channel: &str,
    tx: &mpsc::Sender<String>,
) -> bool {
    use futures_util::StreamExt;

    let mut messages = pubsub.into_on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("📡 Undecodable payload on {}: {}", channel, e);
                continue;
            }
        };
        if tx.send(payload).await.is_err() {
            return false;
        }
    }
    true
}

/// 按 URL 选择通道实现：`local` 为进程内，其余按 Redis URL 处理
pub async fn connect(url: &str) -> Result<Arc<dyn BroadcastBus>> {
    if url == "local" {
        tracing::info!("📡 使用进程内广播通道");
        return Ok(Arc::new(LocalBus::new()));
    }
    connect_remote(url).await
}

#[cfg(feature = "redis")]
async fn connect_remote(url: &str) -> Result<Arc<dyn BroadcastBus>> {
    Ok(Arc::new(RedisBus::connect(url).await?))
}

#[cfg(not(feature = "redis"))]
async fn connect_remote(url: &str) -> Result<Arc<dyn BroadcastBus>> {
    Err(crate::error::Error::Bus(format!(
        "不支持的广播通道 {}（未启用 redis feature）",
        url
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_bus_fanout_to_every_subscriber() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("topic").await.unwrap();
        let mut b = bus.clone().subscribe("topic").await.unwrap();

        bus.publish("topic", "hello".to_string()).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), "hello");
        assert_eq!(b.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_local_bus_filters_channel() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("topic").await.unwrap();

        bus.publish("other", "ignored".to_string()).await.unwrap();
        bus.publish("topic", "seen".to_string()).await.unwrap();

        assert_eq!(sub.recv().await.unwrap(), "seen");
    }

    #[tokio::test]
    async fn test_local_bus_publish_without_subscribers() {
        let bus = LocalBus::new();
        assert!(bus.publish("topic", "lost".to_string()).await.is_ok());

        // 订阅之前发布的消息不会补发
        let mut sub = bus.subscribe("topic").await.unwrap();
        bus.publish("topic", "after".to_string()).await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), "after");
    }

    #[tokio::test]
    async fn test_connect_local() {
        let bus = connect("local").await.unwrap();
        let mut sub = bus.subscribe("topic").await.unwrap();
        bus.publish("topic", "x".to_string()).await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), "x");
    }
}
