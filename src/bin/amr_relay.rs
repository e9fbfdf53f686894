//! amr-relay - AMR 互操作消息中继
//!
//! 负责：
//! - Agent / UI WebSocket 接入
//! - 消息 Schema 校验
//! - 跨进程扇出
//! - Agent 身份 / 状态持久化

use amr_relay::{Relay, RelayConfig};
use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("amr_relay=debug".parse()?))
        .init();

    tracing::info!("🚀 amr-relay v{}", amr_relay::VERSION_FULL);

    // 解析配置
    let config = RelayConfig::from_env()?;
    tracing::info!(
        "配置: bind={}, bus={}, store={}",
        config.bind_addr(),
        config.bus_url,
        config.store.url
    );

    // 创建并运行 Relay（Schema、广播通道、存储任一不可用都直接退出）
    let relay = Relay::new(config).await?;
    relay.run().await?;

    tracing::info!("👋 amr-relay exiting");
    Ok(())
}
