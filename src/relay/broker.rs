//! 扇出代理
//!
//! 进程内投递（直接写入 UI 连接）与进程间传播（发布/订阅）解耦：
//! 所有校验结果先发布到广播通道，每个进程在启动时订阅一次，
//! 收到载荷后推送给本进程 UI 注册表中的每个打开的连接。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::bus::BroadcastBus;
use super::registry::UiRegistry;
use crate::error::Result;
use crate::protocol::Verdict;

/// 重新订阅的退避区间
const RESUBSCRIBE_MIN: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(5);

/// 扇出代理
///
/// 订阅是进程级状态：[`FanoutBroker::start`] 建立唯一的订阅，进程存活期间不取消。
pub struct FanoutBroker {
    bus: Arc<dyn BroadcastBus>,
    channel: String,
    ui: Arc<UiRegistry>,
    pump: JoinHandle<()>,
}

impl FanoutBroker {
    /// 订阅广播主题并启动投递任务
    ///
    /// 首次订阅失败直接返回错误（启动失败）；之后订阅中断由投递任务自动重新订阅。
    pub async fn start(
        bus: Arc<dyn BroadcastBus>,
        channel: &str,
        ui: Arc<UiRegistry>,
    ) -> Result<Arc<Self>> {
        let rx = bus.subscribe(channel).await?;
        let pump = tokio::spawn(Self::pump(
            bus.clone(),
            channel.to_string(),
            rx,
            ui.clone(),
        ));

        tracing::info!("📡 Fanout broker subscribed: channel={}", channel);

        Ok(Arc::new(Self {
            bus,
            channel: channel.to_string(),
            ui,
            pump,
        }))
    }

    /// 发布校验结果（无论是否通过）
    pub async fn publish(&self, verdict: &Verdict) -> Result<()> {
        let payload = verdict.to_json()?;
        self.bus.publish(&self.channel, payload).await
    }

    /// 广播主题名
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 本进程 UI 注册表
    pub fn ui(&self) -> &Arc<UiRegistry> {
        &self.ui
    }

    /// 订阅任务是否仍在运行
    pub fn is_subscribed(&self) -> bool {
        !self.pump.is_finished()
    }

    async fn pump(
        bus: Arc<dyn BroadcastBus>,
        channel: String,
        mut rx: mpsc::Receiver<String>,
        ui: Arc<UiRegistry>,
    ) {
        loop {
            while let Some(payload) = rx.recv().await {
                deliver(&ui, &payload);
            }
            tracing::warn!("📡 Broadcast subscription lost: channel={}", channel);
            rx = resubscribe(bus.as_ref(), &channel).await;
            tracing::info!("📡 Fanout broker resubscribed: channel={}", channel);
        }
    }
}

/// 重新订阅直到成功；间隔按指数退避，中断期间发布的消息丢失
async fn resubscribe(bus: &dyn BroadcastBus, channel: &str) -> mpsc::Receiver<String> {
    let mut backoff = RESUBSCRIBE_MIN;
    loop {
        tokio::time::sleep(backoff).await;
        match bus.subscribe(channel).await {
            Ok(rx) => return rx,
            Err(e) => {
                backoff = (backoff * 2).min(RESUBSCRIBE_MAX);
                tracing::warn!(
                    "📡 Resubscribe to {} failed, retry in {:?}: {}",
                    channel,
                    backoff,
                    e
                );
            }
        }
    }
}

impl Drop for FanoutBroker {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// 推送给本进程所有打开的 UI 连接（非阻塞，fire-and-forget）
///
/// 返回成功入队的连接数。关闭的连接跳过并记录日志，不影响其他连接。
pub fn deliver(ui: &UiRegistry, payload: &str) -> usize {
    let targets = ui.snapshot();
    if targets.is_empty() {
        tracing::trace!("📡 No UI connections");
        return 0;
    }

    let mut delivered = 0;
    for (conn_id, conn) in targets {
        if !conn.is_open() {
            tracing::debug!(
                "📡 Not sending message because websocket is not open: conn_id={}",
                conn_id
            );
            continue;
        }
        match conn.sender.try_send(payload.to_string()) {
            Ok(()) => delivered += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("📡 Channel full, dropping message: conn_id={}", conn_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("📡 Channel closed: conn_id={}", conn_id);
            }
        }
    }

    tracing::debug!("📡 Fanout delivered to {} UI connections", delivered);
    delivered
}
